use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{objective::ObjectiveMetrics, TrainingError};

/// Scalars written at every summary step.
pub const SUMMARY_TAGS: [&str; 4] = [
    "accuracy adv train",
    "accuracy adv",
    "xent adv train",
    "xent adv",
];

/// Stdout progress report.
#[derive(Debug, Clone)]
pub struct Logger {
    enable_stdout: bool,
}

/// Everything printed for one output step.
#[derive(Debug, Clone, Copy)]
pub struct ProgressReport {
    pub step: usize,
    pub natural: ObjectiveMetrics,
    pub adversarial: ObjectiveMetrics,
    pub examples_per_second: Option<f64>,
    /// Attack and update time, when reported separately.
    pub regions: Option<(Duration, Duration)>,
}

impl Logger {
    pub fn new(enable_stdout: bool) -> Self {
        Self { enable_stdout }
    }

    pub fn report(&self, report: &ProgressReport) {
        if !self.enable_stdout {
            return;
        }
        for line in format_report(report) {
            println!("{line}");
        }
    }
}

fn format_report(report: &ProgressReport) -> Vec<String> {
    let mut lines = vec![
        format!(
            "Step {}:    ({})",
            report.step,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f")
        ),
        format!(
            "    training nat accuracy {:.4}%, loss {:.4}",
            report.natural.accuracy * 100.0,
            report.natural.cross_entropy_loss
        ),
        format!(
            "    training adv accuracy {:.4}%, loss {:.4}",
            report.adversarial.accuracy * 100.0,
            report.adversarial.cross_entropy_loss
        ),
        format!(
            "    training IG term {:.4}",
            report.adversarial.attribution_regularizer
        ),
    ];
    if let Some(rate) = report.examples_per_second {
        lines.push(format!("    {} examples per second", rate));
    }
    if let Some((attack, update)) = report.regions {
        lines.push(format!(
            "    attack {:.3}s, update {:.3}s",
            attack.as_secs_f64(),
            update.as_secs_f64()
        ));
    }
    lines
}

/// Appends TensorBoard scalar events to `events.out.tfevents.<ts>.<host>`.
pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl SummaryWriter {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| TrainingError::io(dir, err))?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| TrainingError::io(&path, err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the adversarial summary scalars at `global_step`; cross
    /// entropy is divided by the batch size.
    pub fn write_adversarial_summary(
        &mut self,
        global_step: usize,
        metrics: &ObjectiveMetrics,
        batch_size: usize,
    ) -> Result<(), TrainingError> {
        let xent = metrics.cross_entropy_loss as f64 / batch_size.max(1) as f64;
        let accuracy = metrics.accuracy as f64;
        let values = [accuracy, accuracy, xent, xent];
        let scalars: Vec<(&str, f64)> = SUMMARY_TAGS.iter().copied().zip(values).collect();
        self.write_scalars(global_step as i64, &scalars)
    }

    pub fn write_scalars(
        &mut self,
        step: i64,
        scalars: &[(&str, f64)],
    ) -> Result<(), TrainingError> {
        let summary = Summary {
            value: scalars
                .iter()
                .map(|(tag, value)| summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(*value as f32),
                })
                .collect(),
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode summary event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| TrainingError::io(&self.path, err))?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer
            .flush()
            .map_err(|err| TrainingError::io(&self.path, err))?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metrics(accuracy: f32, summed: f32) -> ObjectiveMetrics {
        ObjectiveMetrics {
            accuracy,
            cross_entropy_loss: summed,
            mean_cross_entropy: summed / 4.0,
            attribution_regularizer: 0.25,
            total_loss: 1.0,
        }
    }

    fn read_records(path: &Path) -> Vec<Event> {
        let bytes = fs::read(path).unwrap();
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len_bytes: [u8; 8] = bytes[offset..offset + 8].try_into().unwrap();
            let len = u64::from_le_bytes(len_bytes) as usize;
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&len_bytes));

            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(
                bytes[offset + 12 + len..offset + 16 + len].try_into().unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(data));
            events.push(Event::decode(data).unwrap());
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn writes_framed_summary_records() {
        let dir = tempdir().unwrap();
        let path = {
            let mut writer = SummaryWriter::create(dir.path(), 10).unwrap();
            writer
                .write_adversarial_summary(7, &metrics(0.5, 8.0), 4)
                .unwrap();
            writer
                .write_adversarial_summary(9, &metrics(0.75, 4.0), 4)
                .unwrap();
            writer.path().to_path_buf()
        };

        let events = read_records(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, 7);
        let values = &events[0].summary.as_ref().unwrap().value;
        let tags: Vec<&str> = values.iter().map(|v| v.tag.as_str()).collect();
        assert_eq!(tags, SUMMARY_TAGS);
        assert_eq!(values[0].simple_value, Some(0.5));
        assert_eq!(values[3].simple_value, Some(2.0));
        assert_eq!(events[1].step, 9);
    }

    #[test]
    fn report_includes_throughput_only_when_available() {
        let mut report = ProgressReport {
            step: 0,
            natural: metrics(1.0, 1.0),
            adversarial: metrics(0.5, 2.0),
            examples_per_second: None,
            regions: None,
        };
        let lines = format_report(&report);
        assert!(lines[0].starts_with("Step 0:"));
        assert_eq!(lines[1], "    training nat accuracy 100.0000%, loss 1.0000");
        assert_eq!(lines[2], "    training adv accuracy 50.0000%, loss 2.0000");
        assert_eq!(lines[3], "    training IG term 0.2500");
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|line| !line.contains("examples per second")));

        report.step = 10;
        report.examples_per_second = Some(12.5);
        report.regions = Some((Duration::from_secs(1), Duration::from_secs(2)));
        let lines = format_report(&report);
        assert!(lines.iter().any(|line| line.contains("12.5 examples per second")));
        assert!(lines.last().unwrap().contains("attack 1.000s"));
    }
}
