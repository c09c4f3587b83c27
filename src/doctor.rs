use crate::{audio, config::AppConfig, config::ConfigStore, telemetry::trace_log_path};
use std::{env, fmt::Display};

pub struct DoctorReport {
    lines: Vec<String>,
}

impl DoctorReport {
    pub fn new(title: &str) -> Self {
        Self {
            lines: vec![title.to_string()],
        }
    }

    pub fn section(&mut self, title: &str) {
        self.lines.push(String::new());
        self.lines.push(format!("{title}:"));
    }

    pub fn push_kv(&mut self, key: &str, value: impl Display) {
        self.lines.push(format!("  {key}: {value}"));
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

pub fn base_doctor_report(config: &AppConfig) -> DoctorReport {
    let mut report = DoctorReport::new("Echomon Doctor");
    report.push_kv("version", env!("CARGO_PKG_VERSION"));
    report.push_kv("os", format!("{}/{}", env::consts::OS, env::consts::ARCH));

    report.section("Config");
    match config.validate() {
        Ok(()) => report.push_kv("validation", "ok"),
        Err(err) => report.push_kv("validation", format!("error: {err}")),
    }
    report.push_kv("config_file", config.config_path.display());
    match ConfigStore::new(&config.config_path).load() {
        Ok(params) => {
            report.push_kv("threshold_dbfs", params.threshold_dbfs);
            report.push_kv("frame_duration", params.frame_duration);
            report.push_kv("taps", params.taps);
        }
        Err(err) => report.push_kv("parameters", format!("error: {err:#}")),
    }
    report.push_kv("sample_rate", config.sample_rate);
    report.push_kv(
        "trigger_log",
        config
            .trigger_log
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "disabled".to_string()),
    );
    report.push_kv("trace_log", trace_log_path().display());

    report.section("Audio");
    report.push_kv(
        "input_device",
        config.input_device.as_deref().unwrap_or("default"),
    );
    report.push_kv(
        "output_device",
        config.output_device.as_deref().unwrap_or("default"),
    );
    match audio::input_device_names() {
        Ok(devices) => {
            report.push_kv("input_count", devices.len());
            if devices.is_empty() {
                report.push_kv("inputs", "none");
            } else {
                report.push_line("  inputs:");
                for name in devices {
                    report.push_line(format!("    - {name}"));
                }
            }
        }
        Err(err) => report.push_kv("inputs", format!("error: {err}")),
    }
    match audio::output_device_names() {
        Ok(devices) => {
            report.push_kv("output_count", devices.len());
            if devices.is_empty() {
                report.push_kv("outputs", "none");
            } else {
                report.push_line("  outputs:");
                for name in devices {
                    report.push_line(format!("    - {name}"));
                }
            }
        }
        Err(err) => report.push_kv("outputs", format!("error: {err}")),
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn report_contains_expected_sections() {
        let config = AppConfig::parse_from(["test-app"]);
        let rendered = base_doctor_report(&config).render();
        assert!(rendered.starts_with("Echomon Doctor"));
        assert!(rendered.contains("Config:"));
        assert!(rendered.contains("Audio:"));
        assert!(rendered.contains("validation: ok"));
    }

    #[test]
    fn report_flags_invalid_config() {
        let config = AppConfig::parse_from(["test-app", "--sample-rate", "1"]);
        let rendered = base_doctor_report(&config).render();
        assert!(rendered.contains("validation: error"));
    }
}
