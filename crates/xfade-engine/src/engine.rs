//! Process-wide playback context: one sink plus the request processor feeding it.
//!
//! Construct it once at startup with the output backend and decoder factory of choice, start it,
//! and call [`Engine::shutdown`] (or drop it) on the way out.

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::decode::DecoderFactory;
use crate::error::SinkResult;
use crate::output::OutputBackend;
use crate::request::{PlaybackListener, RequestQueue};
use crate::sink::{AudioSink, SinkHandle};

pub struct Engine {
    sink: AudioSink,
    queue: RequestQueue,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        backend: Box<dyn OutputBackend>,
        factory: Arc<dyn DecoderFactory>,
        listener: Arc<dyn PlaybackListener>,
    ) -> Self {
        let sink = AudioSink::new(&config.sink, backend);
        let queue = RequestQueue::new(sink.handle(), factory, listener, config.crossfade);
        Self { sink, queue }
    }

    /// Open the output, then start the request processor. The processor is left stopped if the
    /// output fails.
    pub fn start(&mut self) -> SinkResult<()> {
        self.sink.start()?;
        self.queue.start_request_processor();
        Ok(())
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn sink(&self) -> SinkHandle {
        self.sink.handle()
    }

    /// Wait until every queued track has been played out, up to `timeout` for the final drain.
    pub fn wait_until_finished(&self, timeout: Duration) -> bool {
        self.queue.wait_for_idle();
        self.sink.handle().wait_until_drained(timeout)
    }

    pub fn shutdown(&mut self) {
        self.queue.stop_request_processor_and_sink(&mut self.sink);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::decode::ToneFactory;
    use crate::output::MemoryOutput;
    use crate::request::NullListener;

    #[test]
    fn plays_queue_to_the_end() {
        let mut config = EngineConfig {
            sink: SinkConfig {
                sample_rate: 8_000,
                min_playback_blocks: 4,
                queue_capacity_blocks: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        config.crossfade.normal_enabled = false;
        let output = MemoryOutput::new();
        let captured = output.captured();
        let factory = ToneFactory::new(8_000, 2).with_tone("a", 440.0, 1.0);

        let mut engine = Engine::new(&config, Box::new(output), Arc::new(factory), Arc::new(NullListener));
        engine.start().unwrap();
        engine.queue().play("a");
        assert!(engine.wait_until_finished(Duration::from_secs(5)));
        engine.shutdown();
        assert_eq!(captured.lock().unwrap().len(), 16_000);
    }
}
