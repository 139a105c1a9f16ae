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

mod check;
mod watch;

pub use self::{check::Check, watch::Watch};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The Command-Line Interface for Tollgate.
#[derive(clap::Parser)]
#[command(version, about)]
#[non_exhaustive]
pub struct Cli {
    /// Whether Tollgate will report any results to stdout/stderr.
    #[clap(short, long, env = "TOLLGATE_QUIET")]
    pub quiet: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

/// The various Tollgate commands.
#[derive(Clone, clap::Subcommand)]
pub enum Commands {
    Check(Check),
    Watch(Watch),
}

impl Cli {
    /// Drives the application lifecycle using the command line arguments.
    #[tracing::instrument(skip_all)]
    pub async fn drive(self) -> crate::Result<()> {
        let version: std::borrow::Cow<'static, str> = if cfg!(debug_assertions) {
            format!("{VERSION}+debug").into()
        } else {
            VERSION.into()
        };

        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_file(true)
                .with_writer(std::io::stderr)
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(version = &*version, "Starting Tollgate");
        crate::plugins::load_builtin_plugins();

        match self.command {
            Commands::Check(check) => check.run().await,
            Commands::Watch(watch) => watch.run().await,
        }
    }
}
