//! Scripted backend for session and API tests

use anyhow::Result;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use zstudio_runtime_api::{DiffusionBackend, GeneratedImage, InferenceParams};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Attach(String),
    Detach,
    SetWeight(String, f32),
    Infer { seed: u64, guidance_scale: f32, max_sequence_length: usize },
    ReleaseScratch,
}

#[derive(Debug, Default)]
pub struct MockLog {
    pub events: Vec<Event>,
    pub attached: Option<(String, f32)>,
    /// Set if an attach ever happened while another adapter was attached
    pub overlap: bool,
    pub fail_attach: Vec<String>,
    pub fail_infer: Option<String>,
}

impl MockLog {
    pub fn reloads(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Attach(_)))
            .count()
    }

    pub fn infers(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Infer { .. }))
            .count()
    }
}

/// Lets a test hold an inference call open
pub struct GateHandle {
    pub entered: Receiver<()>,
    pub release: Sender<()>,
}

struct Gate {
    entered: Sender<()>,
    release: Mutex<Receiver<()>>,
}

pub struct MockBackend {
    log: Arc<Mutex<MockLog>>,
    gate: Option<Gate>,
}

impl MockBackend {
    pub fn new() -> (Self, Arc<Mutex<MockLog>>) {
        let log = Arc::new(Mutex::new(MockLog::default()));
        (
            Self {
                log: log.clone(),
                gate: None,
            },
            log,
        )
    }

    pub fn gated() -> (Self, Arc<Mutex<MockLog>>, GateHandle) {
        let (mut backend, log) = Self::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        backend.gate = Some(Gate {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });
        (
            backend,
            log,
            GateHandle {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }

    fn log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap()
    }
}

impl DiffusionBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn attach_adapter(&mut self, source: &Path, identifier: &str) -> Result<()> {
        let mut log = self.log();
        log.events.push(Event::Attach(identifier.to_string()));
        if log.attached.is_some() {
            log.overlap = true;
        }
        if !source.exists() || log.fail_attach.iter().any(|f| f == identifier) {
            anyhow::bail!("cannot parse {}", identifier);
        }
        log.attached = Some((identifier.to_string(), 1.0));
        Ok(())
    }

    fn detach_adapter(&mut self) -> Result<()> {
        let mut log = self.log();
        log.events.push(Event::Detach);
        log.attached = None;
        Ok(())
    }

    fn set_adapter_weight(&mut self, identifier: &str, weight: f32) -> Result<()> {
        let mut log = self.log();
        log.events.push(Event::SetWeight(identifier.to_string(), weight));
        match log.attached.as_mut() {
            Some((name, w)) if name == identifier => {
                *w = weight;
                Ok(())
            }
            _ => anyhow::bail!("{} is not attached", identifier),
        }
    }

    fn infer(&mut self, params: &InferenceParams) -> Result<GeneratedImage> {
        let attached = {
            let mut log = self.log();
            log.events.push(Event::Infer {
                seed: params.seed,
                guidance_scale: params.guidance_scale,
                max_sequence_length: params.max_sequence_length,
            });
            if let Some(reason) = &log.fail_infer {
                anyhow::bail!("{}", reason);
            }
            log.attached.clone()
        };

        if let Some(gate) = &self.gate {
            let _ = gate.entered.send(());
            let _ = gate.release.lock().unwrap().recv();
        }

        // Pixels depend on everything that should influence the output
        let mut hasher = DefaultHasher::new();
        params.prompt.hash(&mut hasher);
        params.steps.hash(&mut hasher);
        params.seed.hash(&mut hasher);
        if let Some((name, weight)) = &attached {
            name.hash(&mut hasher);
            weight.to_bits().hash(&mut hasher);
        }
        let mut state = hasher.finish() | 1;

        let len = params.width as usize * params.height as usize * 3;
        let mut pixels = Vec::with_capacity(len);
        while pixels.len() < len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            pixels.push(state as u8);
        }

        Ok(GeneratedImage {
            pixels,
            width: params.width,
            height: params.height,
        })
    }

    fn release_scratch(&mut self) {
        self.log().events.push(Event::ReleaseScratch);
    }
}
