/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    fmt, ops,
    sync::atomic::{AtomicU16, Ordering},
};

/// A set of processing phases.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Phase(u16);

impl Phase {
    pub const NONE: Self = Self(0);
    pub const DECODE_HEADERS: Self = Self(0x01);
    pub const DECODE_DATA: Self = Self(0x02);
    pub const DECODE_TRAILERS: Self = Self(0x04);
    pub const DECODE_REQUEST: Self = Self(0x08);
    pub const ENCODE_HEADERS: Self = Self(0x10);
    pub const ENCODE_DATA: Self = Self(0x20);
    pub const ENCODE_TRAILERS: Self = Self(0x40);
    pub const ENCODE_RESPONSE: Self = Self(0x80);
    pub const ON_LOG: Self = Self(0x100);
    pub const ALL: Self = Self(0x1ff);

    const NAMES: [(Self, &'static str); 9] = [
        (Self::DECODE_HEADERS, "decode_headers"),
        (Self::DECODE_DATA, "decode_data"),
        (Self::DECODE_TRAILERS, "decode_trailers"),
        (Self::DECODE_REQUEST, "decode_request"),
        (Self::ENCODE_HEADERS, "encode_headers"),
        (Self::ENCODE_DATA, "encode_data"),
        (Self::ENCODE_TRAILERS, "encode_trailers"),
        (Self::ENCODE_RESPONSE, "encode_response"),
        (Self::ON_LOG, "on_log"),
    ];

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every phase in `other` is also in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// The name of a single phase, used as a metric and log label.
    pub fn name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(phase, _)| *phase == self)
            .map_or("mixed", |(_, name)| name)
    }
}

impl ops::BitOr for Phase {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl ops::BitOrAssign for Phase {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl ops::BitAnd for Phase {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl ops::BitAndAssign for Phase {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = self.intersection(rhs);
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(
                Self::NAMES
                    .iter()
                    .filter(|(phase, _)| self.contains(*phase))
                    .map(|(_, name)| name),
            )
            .finish()
    }
}

/// A [`Phase`] set shared between threads. It can only shrink.
#[derive(Default)]
pub struct AtomicPhase(AtomicU16);

impl AtomicPhase {
    pub const fn new(phase: Phase) -> Self {
        Self(AtomicU16::new(phase.0))
    }

    pub fn load(&self) -> Phase {
        Phase(self.0.load(Ordering::Acquire))
    }

    /// Removes every phase which is not also in `other`.
    pub fn retain(&self, other: Phase) {
        self.0.fetch_and(other.0, Ordering::AcqRel);
    }
}

impl fmt::Debug for AtomicPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}
