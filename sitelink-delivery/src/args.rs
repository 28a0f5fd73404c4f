//! CLI argument parsing for agents.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for all agents.
#[derive(Parser, Debug, Clone, Default)]
#[command(about = "SiteLink telemetry agent")]
pub struct AgentArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Run a single polling cycle, then exit.
    #[arg(long)]
    pub once: bool,

    /// Print delivery queue statistics and dead letters, then exit.
    #[arg(long)]
    pub inspect_queue: bool,
}

impl AgentArgs {
    /// Parse CLI arguments with a default config path.
    ///
    /// If no `--config` argument is provided, uses the default.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        Self::parse_from_with_default(std::env::args_os(), default_config)
    }

    /// Like [`parse_with_default`](Self::parse_with_default) over explicit arguments.
    pub fn parse_from_with_default<I, T>(args: I, default_config: &'static str) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from_with_default(args, default_config).unwrap_or_else(|e| e.exit())
    }

    /// Fallible form of [`parse_from_with_default`](Self::parse_from_with_default).
    pub fn try_parse_from_with_default<I, T>(
        args: I,
        default_config: &'static str,
    ) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.required(false).default_value(default_config))
            .try_get_matches_from(args)?;

        <Self as clap::FromArgMatches>::from_arg_matches(&matches)
    }

    /// Parse CLI arguments (requires --config to be specified).
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_config() {
        let args = AgentArgs::parse_from_with_default(["sitelink-modbus"], "sitelink.json5");
        assert_eq!(args.config, PathBuf::from("sitelink.json5"));
        assert_eq!(args.log_level, None);
        assert!(!args.once);
    }

    #[test]
    fn test_config_flag_is_optional_with_default() {
        let args = AgentArgs::try_parse_from_with_default(["sitelink-modbus", "--once"], "site.json5")
            .expect("missing --config must fall back to the default");
        assert_eq!(args.config, PathBuf::from("site.json5"));
        assert!(args.once);

        let unknown =
            AgentArgs::try_parse_from_with_default(["sitelink-modbus", "--bogus"], "site.json5");
        assert!(unknown.is_err());
    }

    #[test]
    fn test_args_overrides() {
        let args = AgentArgs::parse_from_with_default(
            [
                "sitelink-modbus",
                "--config",
                "/etc/sitelink/site.json5",
                "--log-level",
                "debug",
                "--once",
            ],
            "sitelink.json5",
        );
        assert_eq!(args.config, PathBuf::from("/etc/sitelink/site.json5"));
        assert_eq!(args.log_level, Some("debug".to_string()));
        assert!(args.once);
        assert!(!args.inspect_queue);
    }
}
