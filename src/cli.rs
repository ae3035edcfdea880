use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

use crate::pipeline::DashboardSnapshot;

#[derive(Parser, Debug)]
#[command(name = "nexus-telemetry")]
#[command(version)]
#[command(about = "Telemetry, edge buffering and per-tenant rate limiting for the Nexus dashboard")]
pub struct Args {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Tenant whose limits size the edge buffer and key dashboard calls
    #[arg(long, global = true)]
    pub tenant: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the pipeline and serve the JSON observability routes
    Serve {
        /// Port to bind on 127.0.0.1
        #[arg(long, default_value = "8787")]
        port: u16,
    },
    /// Run the pipeline and print one dashboard line per interval
    Monitor {
        /// Milliseconds between lines
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many lines (runs until Ctrl+C when omitted)
        #[arg(long)]
        ticks: Option<u32>,
    },
    /// Inject simulated load, print the resulting snapshot as JSON
    Simulate {
        /// Number of 50-reading bursts
        #[arg(long, default_value = "1")]
        bursts: usize,
    },
}

/// One coloured status line for the terminal monitor.
pub fn format_dashboard_line(s: &DashboardSnapshot) -> String {
    let link = if s.edge.is_connected {
        "ONLINE".bright_green()
    } else {
        "OFFLINE".bright_red()
    };
    let fill = if s.edge.capacity == 0 {
        0.0
    } else {
        s.edge.used as f64 / s.edge.capacity as f64 * 100.0
    };
    let fill_text = format!("{:>5.1}%", fill);
    let fill_text = match fill {
        f if f >= 90.0 => fill_text.bright_red(),
        f if f >= 50.0 => fill_text.bright_yellow(),
        _ => fill_text.normal(),
    };

    let metrics = match &s.latest_metric {
        Some(m) => {
            let err = format!("{:.1}%", m.error_rate);
            let err = if m.error_rate > 0.0 { err.bright_red() } else { err.normal() };
            format!(
                "cpu {:>5.1}%  mem {:>5.1}%  p95 {:>6.1}ms  err {}",
                m.cpu_load, m.memory_usage, m.api_latency_p95, err
            )
        }
        None => "waiting for first sample".dimmed().to_string(),
    };

    format!(
        "{} {}  buffer {} ({}/{}, dropped {})  tokens {:.1}/{}  {}",
        s.tenant_id.bright_cyan(),
        link,
        fill_text,
        s.edge.used,
        s.edge.capacity,
        s.edge.dropped,
        s.rate_limit.tokens,
        s.rate_limit_max,
        metrics
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::BufferStatus;
    use crate::rate_limiter::{RateLimiterStats, TokenBucket};

    fn snapshot(used: usize, connected: bool) -> DashboardSnapshot {
        DashboardSnapshot {
            tenant_id: "mid-mfg".into(),
            edge: BufferStatus { capacity: 1000, used, dropped: 3, is_connected: connected },
            rate_limit: TokenBucket { tokens: 42.0, last_refill: 0 },
            rate_limit_max: 100,
            limiter: RateLimiterStats::default(),
            latest_metric: None,
            recent_traces: Vec::new(),
        }
    }

    #[test]
    fn test_args_parse_serve_default_port() {
        let args = Args::parse_from(["nexus", "serve"]);
        assert_eq!(args.command, Command::Serve { port: 8787 });
        assert!(args.config.is_none());
        assert!(args.tenant.is_none());
    }

    #[test]
    fn test_args_parse_serve_custom_port() {
        let args = Args::parse_from(["nexus", "serve", "--port", "3000"]);
        assert_eq!(args.command, Command::Serve { port: 3000 });
    }

    #[test]
    fn test_args_global_flags_after_subcommand() {
        let args = Args::parse_from([
            "nexus", "monitor", "--tenant", "basic-01", "--config", "nexus.toml", "--ticks", "5",
        ]);
        assert_eq!(args.tenant.as_deref(), Some("basic-01"));
        assert_eq!(args.config, Some(PathBuf::from("nexus.toml")));
        assert_eq!(args.command, Command::Monitor { interval_ms: 1000, ticks: Some(5) });
    }

    #[test]
    fn test_args_parse_simulate() {
        let args =
            Args::parse_from(["nexus", "--tenant", "tech-auto", "simulate", "--bursts", "4"]);
        assert_eq!(args.command, Command::Simulate { bursts: 4 });
        assert_eq!(args.tenant.as_deref(), Some("tech-auto"));
    }

    #[test]
    fn test_args_subcommand_required() {
        assert!(Args::try_parse_from(["nexus"]).is_err());
    }

    #[test]
    fn test_dashboard_line_contents() {
        colored::control::set_override(false);
        let line = format_dashboard_line(&snapshot(500, true));
        assert!(line.contains("mid-mfg"));
        assert!(line.contains("ONLINE"));
        assert!(line.contains("50.0%"));
        assert!(line.contains("(500/1000, dropped 3)"));
        assert!(line.contains("tokens 42.0/100"));
        assert!(line.contains("waiting for first sample"));
    }

    #[test]
    fn test_dashboard_line_offline() {
        colored::control::set_override(false);
        assert!(format_dashboard_line(&snapshot(0, false)).contains("OFFLINE"));
    }
}
