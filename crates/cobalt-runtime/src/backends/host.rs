//! Host-resident reference backend
//!
//! Runs every [`ComputeOp`] on the CPU with weights derived from a fixed hash
//! of their coordinates, so two backends always agree on the output of a
//! step. Used for tests and for running the serving core without an
//! accelerator.

use cobalt_types::{CobaltError, Result, StreamId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

use crate::traits::{ComputeBackend, ComputeOp};

const SALT_EMBED: u64 = 0x01;
const SALT_QUERY: u64 = 0x02;
const SALT_KEY: u64 = 0x03;
const SALT_VALUE: u64 = 0x04;
const SALT_FFN: u64 = 0x05;
const SALT_LOGITS: u64 = 0x06;

/// Deterministic pseudo-weight in [-1, 1) (splitmix64 over the coordinates).
fn weight(salt: u64, layer: usize, row: usize, col: usize) -> f32 {
    let mut z = (salt << 56) ^ ((layer as u64) << 44) ^ ((row as u64) << 22) ^ col as u64;
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    ((z >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
}

fn matvec(salt: u64, layer: usize, input: &[f32], output: &mut [f32]) {
    let scale = 1.0 / (input.len() as f32).sqrt();
    for (j, out) in output.iter_mut().enumerate() {
        *out = input
            .iter()
            .enumerate()
            .map(|(i, x)| x * weight(salt, layer, i, j))
            .sum::<f32>()
            * scale;
    }
}

fn rms_norm(x: &mut [f32]) {
    let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / x.len().max(1) as f32;
    let inv = 1.0 / (mean_sq + 1e-6).sqrt();
    x.iter_mut().for_each(|v| *v *= inv);
}

fn shape_error(op: &str, detail: String) -> CobaltError {
    CobaltError::execution(format!("{}: {}", op, detail))
}

/// CPU implementation of [`ComputeBackend`]
#[derive(Debug)]
pub struct HostBackend {
    devices: usize,
    max_streams_per_device: usize,
    next_stream: AtomicU32,
    streams: Mutex<HashMap<u32, HashSet<StreamId>>>,
    executed_ops: AtomicU64,
}

impl HostBackend {
    /// Backend exposing `devices` virtual devices
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            max_streams_per_device: 64,
            next_stream: AtomicU32::new(1),
            streams: Mutex::new(HashMap::new()),
            executed_ops: AtomicU64::new(0),
        }
    }

    /// Limit the number of live streams per device
    pub fn with_max_streams_per_device(mut self, max: usize) -> Self {
        self.max_streams_per_device = max;
        self
    }

    /// Operations executed since construction
    pub fn executed_ops(&self) -> u64 {
        self.executed_ops.load(Ordering::Relaxed)
    }

    /// Live streams on `device_id`
    pub fn stream_count(&self, device_id: u32) -> usize {
        self.streams
            .lock()
            .get(&device_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn stream_exists(&self, stream: StreamId) -> bool {
        self.streams.lock().values().any(|s| s.contains(&stream))
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn device_count(&self) -> usize {
        self.devices
    }

    fn create_stream(&self, device_id: u32) -> Result<StreamId> {
        if device_id as usize >= self.devices {
            return Err(CobaltError::not_found(format!(
                "device {} not present ({} available)",
                device_id, self.devices
            )));
        }
        let mut streams = self.streams.lock();
        let live = streams.entry(device_id).or_default();
        if live.len() >= self.max_streams_per_device {
            return Err(CobaltError::resource_exhausted(format!(
                "device {} already has {} streams",
                device_id,
                live.len()
            )));
        }
        let stream = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        live.insert(stream);
        debug!("created {} on device {}", stream, device_id);
        Ok(stream)
    }

    fn destroy_stream(&self, device_id: u32, stream: StreamId) -> Result<()> {
        let mut streams = self.streams.lock();
        let removed = streams
            .get_mut(&device_id)
            .map(|s| s.remove(&stream))
            .unwrap_or(false);
        if !removed {
            return Err(CobaltError::not_found(format!(
                "{} not found on device {}",
                stream, device_id
            )));
        }
        Ok(())
    }

    fn execute(&self, op: ComputeOp<'_>, stream: StreamId) -> Result<()> {
        if !self.stream_exists(stream) {
            return Err(CobaltError::execution(format!(
                "{} on unknown {}",
                op.name(),
                stream
            )));
        }
        let name = op.name();
        trace!("{} on {}", name, stream);

        match op {
            ComputeOp::Embed { token, output } => {
                let row = token.index();
                for (j, out) in output.iter_mut().enumerate() {
                    *out = weight(SALT_EMBED, 0, row, j);
                }
                rms_norm(output);
            }
            ComputeOp::Project {
                layer,
                input,
                query,
                key,
                value,
            } => {
                if query.len() != input.len() || key.len() != input.len() || value.len() != input.len()
                {
                    return Err(shape_error(
                        name,
                        format!(
                            "input {} vs outputs {}/{}/{}",
                            input.len(),
                            query.len(),
                            key.len(),
                            value.len()
                        ),
                    ));
                }
                matvec(SALT_QUERY, layer, input, query);
                matvec(SALT_KEY, layer, input, key);
                matvec(SALT_VALUE, layer, input, value);
            }
            ComputeOp::Attention {
                layer: _,
                num_heads,
                head_dim,
                query,
                keys,
                values,
                output,
            } => {
                let hidden = num_heads * head_dim;
                if hidden == 0
                    || query.len() != hidden
                    || output.len() != hidden
                    || keys.len() != values.len()
                    || keys.is_empty()
                    || keys.len() % hidden != 0
                {
                    return Err(shape_error(
                        name,
                        format!(
                            "query {} keys {} values {} for {}x{} heads",
                            query.len(),
                            keys.len(),
                            values.len(),
                            num_heads,
                            head_dim
                        ),
                    ));
                }
                let positions = keys.len() / hidden;
                let scale = 1.0 / (head_dim as f32).sqrt();
                let mut scores = vec![0.0f32; positions];
                for h in 0..num_heads {
                    let q = &query[h * head_dim..(h + 1) * head_dim];
                    for (p, score) in scores.iter_mut().enumerate() {
                        let k = &keys[p * hidden + h * head_dim..p * hidden + (h + 1) * head_dim];
                        *score = q.iter().zip(k).map(|(a, b)| a * b).sum::<f32>() * scale;
                    }
                    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let mut denom = 0.0;
                    for s in scores.iter_mut() {
                        *s = (*s - max).exp();
                        denom += *s;
                    }
                    let out = &mut output[h * head_dim..(h + 1) * head_dim];
                    out.fill(0.0);
                    for (p, s) in scores.iter().enumerate() {
                        let v = &values[p * hidden + h * head_dim..p * hidden + (h + 1) * head_dim];
                        for (o, x) in out.iter_mut().zip(v) {
                            *o += s / denom * x;
                        }
                    }
                }
            }
            ComputeOp::FeedForward { layer, hidden } => {
                let mut projected = vec![0.0f32; hidden.len()];
                matvec(SALT_FFN, layer, hidden, &mut projected);
                for (h, p) in hidden.iter_mut().zip(&projected) {
                    *h += p.tanh();
                }
                rms_norm(hidden);
            }
            ComputeOp::Logits { hidden, logits } => {
                if hidden.is_empty() || logits.is_empty() {
                    return Err(shape_error(name, "empty hidden state or vocabulary".into()));
                }
                let scale = 4.0 / (hidden.len() as f32).sqrt();
                for (v, out) in logits.iter_mut().enumerate() {
                    *out = hidden
                        .iter()
                        .enumerate()
                        .map(|(i, x)| x * weight(SALT_LOGITS, 0, v, i))
                        .sum::<f32>()
                        * scale;
                }
            }
        }

        self.executed_ops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
