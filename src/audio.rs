use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};

pub type Frame = Arc<[f32]>;

const FRAME_CAPACITY: usize = 64;

/// A mono audio stream fanned out to any number of readers.
///
/// Frames pushed while the stream is disabled are replaced with silence of the
/// same length, so readers keep their timing. Nothing is delivered once the
/// stream has been stopped.
#[derive(Clone)]
pub struct AudioStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: String,
    sample_rate: u32,
    tx: broadcast::Sender<Frame>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl AudioStream {
    pub fn new(id: impl Into<String>, sample_rate: u32) -> Self {
        let (tx, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            inner: Arc::new(StreamInner {
                id: id.into(),
                sample_rate,
                tx,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn push(&self, samples: &[f32]) {
        if !self.is_live() || samples.is_empty() {
            return;
        }
        let frame: Frame = if self.is_enabled() {
            Arc::from(samples)
        } else {
            Arc::from(vec![0.0; samples.len()])
        };
        // No subscribers is fine.
        let _ = self.inner.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.inner.tx.subscribe()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.live.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn same_stream(&self, other: &AudioStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("id", &self.inner.id)
            .field("sample_rate", &self.inner.sample_rate)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Keeps a device thread alive; the thread releases its device when this drops.
pub struct DeviceGuard {
    stop: Option<std_mpsc::Sender<()>>,
}

impl DeviceGuard {
    /// A guard with no device behind it.
    pub fn detached() -> Self {
        Self { stop: None }
    }

    fn release(&mut self) {
        // Dropping the sender wakes the device thread.
        self.stop.take();
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct LocalCapture {
    stream: AudioStream,
    guard: DeviceGuard,
}

impl LocalCapture {
    pub fn new(stream: AudioStream, guard: DeviceGuard) -> Self {
        Self { stream, guard }
    }

    pub fn stream(&self) -> &AudioStream {
        &self.stream
    }

    /// Stops the stream and releases the capture device.
    pub fn stop(mut self) {
        self.stream.stop();
        self.guard.release();
    }
}

pub struct Playback {
    _guard: DeviceGuard,
    feeder: Option<JoinHandle<()>>,
}

impl Playback {
    pub fn detached() -> Self {
        Self {
            _guard: DeviceGuard::detached(),
            feeder: None,
        }
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

/// Where microphone streams come from and remote streams go to.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn acquire_microphone(&self) -> Result<LocalCapture>;

    /// Starts playing `stream` immediately; playback stops when the handle drops.
    async fn play(&self, stream: &AudioStream) -> Result<Playback>;
}

/// Default input and output devices of the host.
#[derive(Default)]
pub struct CpalBackend;

#[async_trait]
impl MediaBackend for CpalBackend {
    async fn acquire_microphone(&self) -> Result<LocalCapture> {
        tokio::task::spawn_blocking(AudioCapture::start)
            .await
            .map_err(|e| AppError::Media(format!("capture thread failed: {}", e)))?
    }

    async fn play(&self, stream: &AudioStream) -> Result<Playback> {
        let buffer = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let output_buffer = buffer.clone();
        let stream_id = stream.id().to_string();
        let (guard, device_rate) = tokio::task::spawn_blocking(move || AudioPlayback::open_device(output_buffer, stream_id))
            .await
            .map_err(|e| AppError::Media(format!("playback thread failed: {}", e)))??;
        Ok(AudioPlayback::feed(stream, buffer, guard, device_rate))
    }
}

struct AudioCapture;

impl AudioCapture {
    fn start() -> Result<LocalCapture> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<std::result::Result<AudioStream, String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || match Self::open() {
                Ok((input_stream, audio)) => {
                    let _ = ready_tx.send(Ok(audio));
                    let _ = stop_rx.recv();
                    drop(input_stream);
                    tracing::debug!("microphone released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                }
            })?;

        let stream = ready_rx
            .recv()
            .map_err(|_| AppError::Media("capture thread exited".into()))?
            .map_err(AppError::Media)?;

        Ok(LocalCapture::new(
            stream,
            DeviceGuard {
                stop: Some(stop_tx),
            },
        ))
    }

    fn open() -> anyhow::Result<(cpal::Stream, AudioStream)> {
        let host = cpal::default_host();
        let input_device = host
            .default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No input device available"))?;

        let config = input_device.default_input_config()?;
        tracing::info!("Input config: {:?}", config);

        let audio = AudioStream::new("local", config.sample_rate().0);
        let channels = config.channels() as usize;
        let stream_config: cpal::StreamConfig = config.config();

        let input_stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_input_stream::<f32>(&input_device, &stream_config, channels, audio.clone())?,
            SampleFormat::I16 => Self::build_input_stream::<i16>(&input_device, &stream_config, channels, audio.clone())?,
            SampleFormat::U16 => Self::build_input_stream::<u16>(&input_device, &stream_config, channels, audio.clone())?,
            sample_format => return Err(anyhow::anyhow!("Unsupported sample format: {:?}", sample_format)),
        };

        input_stream.play()?;

        Ok((input_stream, audio))
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        channels: usize,
        audio: AudioStream,
    ) -> anyhow::Result<cpal::Stream>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let err_fn = |err| tracing::error!("An error occurred on the input audio stream: {}", err);

        let stream = device.build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                audio.push(&downmix(data, channels));
            },
            err_fn,
            None,
        )?;

        Ok(stream)
    }
}

/// Averages interleaved frames down to one channel.
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
            sum / frame.len() as f32
        })
        .collect()
}

/// Linear-interpolation resampler, good enough for speech.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let last = samples.len() - 1;
    let out_len = ((samples.len() as u64 * to as u64) / from as u64).max(1) as usize;
    let step = from as f64 / to as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

struct AudioPlayback;

impl AudioPlayback {
    /// Opens the output device on its own thread. Blocks until the device is
    /// running or has failed to open.
    fn open_device(buffer: Arc<Mutex<VecDeque<f32>>>, stream_id: String) -> Result<(DeviceGuard, u32)> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<std::result::Result<u32, String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name(format!("playback-{}", stream_id))
            .spawn(move || match Self::open(buffer) {
                Ok((output_stream, device_rate)) => {
                    let _ = ready_tx.send(Ok(device_rate));
                    let _ = stop_rx.recv();
                    drop(output_stream);
                    tracing::debug!("playback for {} released", stream_id);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                }
            })?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| AppError::Media("playback thread exited".into()))?
            .map_err(AppError::Media)?;

        Ok((
            DeviceGuard {
                stop: Some(stop_tx),
            },
            device_rate,
        ))
    }

    /// Moves `stream` into the device queue, resampled to the device rate.
    fn feed(stream: &AudioStream, buffer: Arc<Mutex<VecDeque<f32>>>, guard: DeviceGuard, device_rate: u32) -> Playback {
        // At most half a second of queued audio.
        let limit = (device_rate / 2).max(1) as usize;
        let stream_rate = stream.sample_rate();
        let mut frames = stream.subscribe();
        let feeder = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        if let Ok(mut queue) = buffer.lock() {
                            queue.extend(resample(&frame, stream_rate, device_rate));
                            let excess = queue.len().saturating_sub(limit);
                            queue.drain(..excess);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Playback {
            _guard: guard,
            feeder: Some(feeder),
        }
    }

    fn open(buffer: Arc<Mutex<VecDeque<f32>>>) -> anyhow::Result<(cpal::Stream, u32)> {
        let host = cpal::default_host();
        let output_device = host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No output device available"))?;

        let config = output_device.default_output_config()?;
        tracing::info!("Output config: {:?}", config);

        let channels = config.channels() as usize;
        let device_rate = config.sample_rate().0;
        let stream_config: cpal::StreamConfig = config.config();

        let output_stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_output_stream::<f32>(&output_device, &stream_config, channels, buffer)?,
            SampleFormat::I16 => Self::build_output_stream::<i16>(&output_device, &stream_config, channels, buffer)?,
            SampleFormat::U16 => Self::build_output_stream::<u16>(&output_device, &stream_config, channels, buffer)?,
            sample_format => return Err(anyhow::anyhow!("Unsupported sample format: {:?}", sample_format)),
        };

        output_stream.play()?;

        Ok((output_stream, device_rate))
    }

    fn build_output_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        channels: usize,
        buffer: Arc<Mutex<VecDeque<f32>>>,
    ) -> anyhow::Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32> + Send + 'static,
    {
        let err_fn = |err| tracing::error!("An error occurred on the output audio stream: {}", err);
        let channels = channels.max(1);

        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = match buffer.lock() {
                    Ok(queue) => queue,
                    Err(_) => return,
                };
                for frame in data.chunks_mut(channels) {
                    // Silence when nothing is queued.
                    let value = queue.pop_front().unwrap_or(0.0);
                    for sample in frame.iter_mut() {
                        *sample = T::from_sample(value);
                    }
                }
            },
            err_fn,
            None,
        )?;

        Ok(stream)
    }
}
