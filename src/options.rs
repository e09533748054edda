use clap::{Parser, Subcommand};

/// isolar-bridge - poller for Easun / ISolar / Voltronic inverters
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Poll the inverter until interrupted (default)
    #[default]
    Run,

    /// Dump raw holding registers as JSON
    ScanRegisters {
        #[clap(long, default_value_t = 0)]
        start: u16,
        #[clap(long, default_value_t = 100)]
        count: u16,
    },

    /// Probe Modbus unit ids and report which ones answer
    ScanDevices {
        #[clap(long, default_value_t = 1)]
        start: u8,
        #[clap(long, default_value_t = 247)]
        end: u8,
    },
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_run() {
        let options = Options::parse_from(["isolar-bridge"]);
        assert_eq!(options.config_file, "config.yaml");
        assert_eq!(options.runtime, None);
        assert_eq!(options.command(), Command::Run);
    }

    #[test]
    fn scan_subcommands() {
        let options = Options::parse_from([
            "isolar-bridge",
            "-c",
            "/etc/isolar.yaml",
            "scan-registers",
            "--start",
            "200",
            "--count",
            "40",
        ]);
        assert_eq!(options.config_file, "/etc/isolar.yaml");
        assert_eq!(
            options.command(),
            Command::ScanRegisters {
                start: 200,
                count: 40
            }
        );

        let options = Options::parse_from(["isolar-bridge", "scan-devices", "--end", "5"]);
        assert_eq!(options.command(), Command::ScanDevices { start: 1, end: 5 });
    }
}
