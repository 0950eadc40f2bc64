//! Command-line options.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "core0")]
#[command(version, about = "Container host agent", long_about = None)]
pub struct Options {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/core0/core0.toml")]
    pub config: PathBuf,

    /// Grid id of this node.
    #[arg(long, default_value_t = 0)]
    pub gid: u32,

    /// Node id within the grid.
    #[arg(long, default_value_t = 0)]
    pub nid: u32,
}

impl Options {
    /// Collects every violation; the caller prints one line each and
    /// exits non-zero.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.gid == 0 {
            errors.push("gid can't be 0".to_string());
        }
        if self.nid == 0 {
            errors.push("nid can't be 0".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ids_are_each_reported() {
        let options = Options::try_parse_from(["core0"]).unwrap();
        assert_eq!(options.validate().len(), 2);

        let options = Options::try_parse_from(["core0", "--gid", "1"]).unwrap();
        assert_eq!(options.validate(), vec!["nid can't be 0".to_string()]);

        let options = Options::try_parse_from(["core0", "--gid", "1", "--nid", "2"]).unwrap();
        assert!(options.validate().is_empty());
    }

    #[test]
    fn config_flag_overrides_the_default_path() {
        let options =
            Options::try_parse_from(["core0", "-c", "/tmp/core0.toml", "--gid", "1", "--nid", "1"])
                .unwrap();
        assert_eq!(options.config, PathBuf::from("/tmp/core0.toml"));
    }
}
