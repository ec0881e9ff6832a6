//! Output device discovery and stream format negotiation.
//!
//! The sink format is fixed at startup, so negotiation looks for a device config that runs at
//! exactly the sink rate and falls back to the closest rate only so the error message can name it.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle` (case-insensitive), or the host
/// default when no needle is given.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle.filter(|n| !n.trim().is_empty()) {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|desc| matches_device_name(&desc.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the output config closest to `target_rate`.
///
/// Ranges containing the target win; among those, the sample format with the best rank. Otherwise
/// the nearest rate is returned and the caller decides whether that is acceptable.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
    channels: usize,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("query output configs")?
        .collect();

    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            distance: rate.abs_diff(target_rate),
            channels_match: range.channels() as usize == channels,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = best
            .as_ref()
            .map(|(b, _)| is_better_candidate(&candidate, b))
            .unwrap_or(true);
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Fixed buffer size closest to `preferred` frames, or `None` to keep the device default.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    preferred: u32,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } if min <= max => {
            Some(cpal::BufferSize::Fixed(preferred.clamp(*min, *max)))
        }
        _ => None,
    }
}

/// Print output devices with their supported rate ranges.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        let name = d.description()?.to_string();
        let (min, max) = d
            .supported_output_configs()
            .map(|ranges| {
                ranges.fold((u32::MAX, 0), |(lo, hi), r| {
                    (lo.min(r.min_sample_rate()), hi.max(r.max_sample_rate()))
                })
            })
            .unwrap_or((0, 0));
        if max == 0 {
            println!("#{i}: {name}");
        } else {
            println!("#{i}: {name} ({min}-{max} Hz)");
        }
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    distance: u32,
    channels_match: bool,
    format_rank: u8,
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(candidate: &Candidate, best: &Candidate) -> bool {
    if candidate.distance != best.distance {
        candidate.distance < best.distance
    } else if candidate.channels_match != best.channels_match {
        candidate.channels_match
    } else {
        candidate.format_rank < best.format_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
