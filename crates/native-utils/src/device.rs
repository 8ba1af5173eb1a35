use anyhow::Context;
use cpal::Device;
use cpal::traits::{DeviceTrait, HostTrait};

fn get_host() -> cpal::Host {
    cpal::default_host()
}

/// The named input device, or the host's default when no name is given.
pub fn get_or_default_input(device_name: Option<&str>) -> anyhow::Result<Device> {
    let host = get_host();
    tracing::debug!("Host: {:?}", host.id());
    match device_name {
        None => host
            .default_input_device()
            .context("no default input device"),
        Some(target) => host
            .input_devices()
            .context("failed to enumerate input devices")?
            .find(|d| d.name().is_ok_and(|name| name == target))
            .with_context(|| format!("input device '{target}' not found")),
    }
}

/// One line per input device with its default channel count and rate.
pub fn get_available_inputs() -> anyhow::Result<String> {
    for host in cpal::available_hosts() {
        tracing::debug!("Available host: {:?}", host);
    }

    let host = get_host();
    let default_device = host.default_input_device().and_then(|d| d.name().ok());

    let mut device_names: Vec<String> = Vec::new();
    for device in host
        .input_devices()
        .context("failed to enumerate input devices")?
    {
        let Ok(name) = device.name() else {
            continue;
        };
        let mut line = match device.default_input_config() {
            Ok(cfg) => format!(" * {}({}ch, {}hz)", name, cfg.channels(), cfg.sample_rate().0),
            Err(_) => format!(" * {}(no default config)", name),
        };
        if default_device.as_deref() == Some(name.as_str()) {
            line.push_str(" [default]");
        }
        device_names.push(line);
    }
    Ok(device_names.join("\n"))
}
