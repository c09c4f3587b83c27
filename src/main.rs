use anyhow::Result;
use clap::Parser;
use echomon::{
    audio::{self, MicSource, Speaker},
    config::{AppConfig, ConfigStore},
    doctor::base_doctor_report,
    events::{CsvTriggerLog, NullTriggerLog, TriggerLog},
    telemetry::init_tracing,
    Service, SharedState,
};
use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[cfg(not(test))]
fn main() -> Result<()> {
    run_with_args(env::args_os())
}

#[cfg_attr(test, allow(dead_code))]
fn run_with_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let config = AppConfig::parse_from(args);
    if config.doctor {
        let report = base_doctor_report(&config);
        println!("{}", report.render());
        return Ok(());
    }

    if config.list_devices {
        let output = list_devices()?;
        print!("{output}");
        return Ok(());
    }

    config.validate()?;
    init_tracing(&config);
    tracing::info!("starting echo monitor service");

    let store = Arc::new(ConfigStore::new(&config.config_path));
    let params = store.load()?;
    let state = Arc::new(SharedState::new(params));

    let input = Arc::new(MicSource::new(
        config.input_device.as_deref(),
        config.sample_rate,
    )?);
    tracing::info!("capturing from '{}'", input.device_name());
    let output = Arc::new(Speaker::new(
        config.output_device.as_deref(),
        config.sample_rate,
    )?);
    tracing::info!("playing through '{}'", output.device_name());

    let trigger_log: Arc<dyn TriggerLog> = match &config.trigger_log {
        Some(path) => Arc::new(CsvTriggerLog::new(path)),
        None => Arc::new(NullTriggerLog),
    };

    let service = Service::new(
        state,
        input,
        output,
        trigger_log,
        store,
        config.sample_rate,
    );

    // The shutdown flag exists for embedders and tests; the binary monitors
    // until the process is killed.
    let shutdown = Arc::new(AtomicBool::new(false));
    let monitor = service.spawn_monitor(shutdown);
    monitor
        .join()
        .map_err(|_| anyhow::anyhow!("capture loop panicked"))?;
    Ok(())
}

fn list_devices() -> Result<String> {
    let inputs = devices_from_env_or("ECHOMON_TEST_INPUTS", audio::input_device_names)?;
    let outputs = devices_from_env_or("ECHOMON_TEST_OUTPUTS", audio::output_device_names)?;

    let mut output = String::new();
    render_device_section(&mut output, "input", &inputs);
    render_device_section(&mut output, "output", &outputs);
    Ok(output)
}

fn devices_from_env_or(var: &str, detect: fn() -> Result<Vec<String>>) -> Result<Vec<String>> {
    if let Ok(raw) = env::var(var) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        return Ok(trimmed
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect());
    }
    detect()
}

fn render_device_section(output: &mut String, kind: &str, devices: &[String]) {
    if devices.is_empty() {
        output.push_str(&format!("No audio {kind} devices detected.\n"));
    } else {
        output.push_str(&format!("Available audio {kind} devices:\n"));
        for name in devices {
            output.push_str(&format!("  - {name}\n"));
        }
    }
}
