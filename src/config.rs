use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

/// RTK Sensor Fleet Configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Sensor to manage, as IP or IP=LABEL. Repeatable.
    #[arg(long = "sensor", value_name = "IP[=LABEL]")]
    pub sensors: Vec<String>,

    /// TCP port of the sensors' power-status channel.
    #[arg(long, default_value_t = crate::constants::POWER_PORT)]
    pub power_port: u16,

    /// TCP port of the sensors' GPS/NMEA channel.
    #[arg(long, default_value_t = crate::constants::GPS_PORT)]
    pub gps_port: u16,

    /// NTRIP caster host. Without it the fleet runs plain GPS, no RTK.
    #[arg(long, value_name = "HOST")]
    pub ntrip_host: Option<String>,

    /// NTRIP caster port.
    #[arg(long, default_value_t = crate::constants::NTRIP_PORT)]
    pub ntrip_port: u16,

    /// NTRIP username.
    #[arg(long, default_value = "")]
    pub ntrip_user: String,

    /// NTRIP password.
    #[arg(long, default_value = "")]
    pub ntrip_password: String,

    /// NTRIP mount point.
    #[arg(long, default_value = "")]
    pub ntrip_mount: String,

    /// Write a JSON snapshot of the fleet to this file every second.
    #[arg(long, value_name = "FILE")]
    pub state_file: Option<PathBuf>,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

/// Parse one `--sensor` argument: `ip` or `ip=label`.
pub fn parse_sensor_spec(spec: &str) -> Result<(IpAddr, Option<String>)> {
    let (ip_part, label) = match spec.split_once('=') {
        Some((ip, label)) if !label.is_empty() => (ip, Some(label.to_string())),
        Some((ip, _)) => (ip, None),
        None => (spec, None),
    };
    let addr: IpAddr = ip_part
        .trim()
        .parse()
        .map_err(|_| Error::BadSensorSpec(spec.to_string()))?;
    Ok((addr, label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_without_label() {
        let (addr, label) = parse_sensor_spec("192.168.0.10").unwrap();
        assert_eq!(addr, "192.168.0.10".parse::<IpAddr>().unwrap());
        assert!(label.is_none());
    }

    #[test]
    fn test_spec_with_label() {
        let (addr, label) = parse_sensor_spec("192.168.0.10=north-field").unwrap();
        assert_eq!(addr, "192.168.0.10".parse::<IpAddr>().unwrap());
        assert_eq!(label.as_deref(), Some("north-field"));
    }

    #[test]
    fn test_spec_with_empty_label() {
        let (_, label) = parse_sensor_spec("192.168.0.10=").unwrap();
        assert!(label.is_none());
    }

    #[test]
    fn test_bad_spec() {
        assert!(parse_sensor_spec("not-an-ip").is_err());
        assert!(parse_sensor_spec("=label").is_err());
    }
}
