//! Implementation of the `deckhand deploy` command.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use clap::{Args, ValueEnum};
use deckhand_control::{DeckhandConfig, DeployRequest, RouteKind, SecretsFormat};
use tokio_util::sync::CancellationToken;

/// Arguments for the deploy command.
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Repository as owner/repo, or repo under the configured owner
    pub repo: String,

    /// Service name (defaults to the repository name)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Release tag (defaults to the latest release)
    #[arg(short, long)]
    pub version: Option<String>,

    /// Port to run on (allocated from the configured range when omitted)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host name or path prefix to route to the service
    #[arg(short, long)]
    pub route: Option<String>,

    /// Route type (inferred from the route when omitted)
    #[arg(long)]
    pub route_type: Option<RouteKind>,

    /// Extra environment entry for the secrets file, KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Do not provision a database
    #[arg(long)]
    pub no_database: bool,

    /// Secrets file format
    #[arg(long, value_enum, default_value_t = FormatArg::Env)]
    pub secrets_format: FormatArg,
}

/// Secrets file format as given on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum FormatArg {
    /// KEY=VALUE lines
    Env,
    /// TOML table
    Toml,
}

impl From<FormatArg> for SecretsFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Env => Self::Env,
            FormatArg::Toml => Self::Toml,
        }
    }
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid --env {pair:?}: expected KEY=VALUE");
        };
        env.insert(key.to_owned(), value.to_owned());
    }
    Ok(env)
}

pub async fn run(config: &DeckhandConfig, cancel: CancellationToken, args: DeployArgs) -> Result<()> {
    config.validate()?;

    let request = DeployRequest {
        repo: args.repo,
        name: args.name,
        version: args.version,
        port: args.port,
        route: args.route,
        route_kind: args.route_type,
        extra_env: parse_env(&args.env)?,
        skip_database: args.no_database,
        secrets_format: args.secrets_format.into(),
    };

    let orchestrator = super::connect(config, cancel).await?;
    let result = orchestrator.deploy(request).await?;
    let record = &result.record;

    println!("Deployed {} {}", record.name, record.version);
    println!("  Port:     {}", record.port);
    if let Some(route) = &record.route {
        println!("  Route:    {route}");
    }
    if let Some(db) = &record.database {
        println!("  Database: {} (user {})", db.name, db.user);
    }
    println!("  Unit:     {}", record.isolation().unit);
    super::print_warnings(&result.warnings);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_split_on_first_equals() {
        let env = parse_env(&["A=1".to_owned(), "URL=http://x?a=b".to_owned()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["URL"], "http://x?a=b");
    }

    #[test]
    fn env_pair_without_equals_is_rejected() {
        assert!(parse_env(&["NOPE".to_owned()]).is_err());
    }
}
