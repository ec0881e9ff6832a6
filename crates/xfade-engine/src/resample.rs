//! Synchronous sample-rate conversion for decoders.
//!
//! Wraps Rubato's async sinc resampler behind a push interface: feed any number of interleaved
//! frames, get back whatever whole input chunks produced, and flush the partial tail at end of
//! stream.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

pub struct StreamResampler {
    resampler: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    out: Vec<f32>,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        let ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .context("create resampler")?;
        let out = vec![0.0; resampler.output_frames_max() * channels];

        tracing::debug!(src_rate, dst_rate, channels, "resampler ready");
        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            pending: Vec::new(),
            out,
        })
    }

    /// Queue interleaved input and return all output that full chunks produced.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(interleaved);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut produced = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let n = self.run(consumed, self.chunk_frames, None)?;
            produced.extend_from_slice(&self.out[..n * self.channels]);
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(produced)
    }

    /// Convert the remaining partial chunk.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let frames = self.pending.len() / self.channels;
        if frames == 0 {
            self.pending.clear();
            return Ok(Vec::new());
        }
        self.pending.resize(self.chunk_frames * self.channels, 0.0);
        let n = self.run(0, self.chunk_frames, Some(frames))?;
        self.pending.clear();
        Ok(self.out[..n * self.channels].to_vec())
    }

    fn run(&mut self, offset: usize, frames: usize, partial_len: Option<usize>) -> Result<usize> {
        let input = &self.pending[offset..offset + frames * self.channels];
        let input_adapter = InterleavedSlice::new(input, self.channels, frames)
            .context("interleaved slice (input)")?;
        let out_frames = self.out.len() / self.channels;
        let mut output_adapter = InterleavedSlice::new_mut(&mut self.out, self.channels, out_frames)
            .context("interleaved slice (output)")?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .context("resample")?;
        Ok(nbr_out)
    }
}
