//! The generation session: one loaded model, at most one adapter, one
//! request at a time.
//!
//! The backend sits behind a mutex that is held for the whole
//! adapter-swap-and-infer sequence of a request. A second caller either waits
//! for it ([`GenerationSession::generate`]) or is turned away with
//! [`SessionError::Busy`] ([`GenerationSession::try_generate`]).

use chrono::Local;
use image::RgbImage;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;
use zstudio_core::{AdapterIdentity, AdapterRegistry, OutputWriter};
use zstudio_runtime_api::{DiffusionBackend, InferenceParams};

use crate::error::{reason, SessionError};
use crate::validate::{GenerationRequest, SeedChoice, MAX_SEED};

type Backend = Box<dyn DiffusionBackend>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveAdapter {
    pub identity: AdapterIdentity,
    pub weight: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Generating,
}

#[derive(Debug)]
pub struct GenerationResult {
    pub image: RgbImage,
    pub seed_used: u32,
    pub duration_seconds: f64,
    pub saved_path: PathBuf,
}

impl GenerationResult {
    pub fn status_line(&self) -> String {
        format!(
            "Done in {:.2}s! Saved to: {}",
            self.duration_seconds,
            self.saved_path.display()
        )
    }
}

/// Held for the duration of one request. Dropping it frees scratch buffers
/// and marks the session idle before the backend lock is released, on every
/// exit path.
struct Flight<'a> {
    backend: MutexGuard<'a, Backend>,
    generating: &'a AtomicBool,
}

impl<'a> Flight<'a> {
    fn start(backend: MutexGuard<'a, Backend>, generating: &'a AtomicBool) -> Self {
        generating.store(true, Ordering::SeqCst);
        Self {
            backend,
            generating,
        }
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.backend.release_scratch();
        self.generating.store(false, Ordering::SeqCst);
    }
}

pub struct GenerationSession {
    backend: Mutex<Backend>,
    /// Only written while `backend` is locked; read freely for status
    active: Mutex<Option<ActiveAdapter>>,
    generating: AtomicBool,
    registry: AdapterRegistry,
    writer: OutputWriter,
    model_name: String,
}

impl GenerationSession {
    pub fn new(backend: Backend, registry: AdapterRegistry, writer: OutputWriter) -> Self {
        let model_name = backend.name().to_string();
        Self {
            backend: Mutex::new(backend),
            active: Mutex::new(None),
            generating: AtomicBool::new(false),
            registry,
            writer,
            model_name,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn writer(&self) -> &OutputWriter {
        &self.writer
    }

    pub fn state(&self) -> SessionState {
        if self.generating.load(Ordering::SeqCst) {
            SessionState::Generating
        } else {
            SessionState::Idle
        }
    }

    pub fn active_adapter(&self) -> Option<ActiveAdapter> {
        self.active_slot().clone()
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<ActiveAdapter>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_backend(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_backend(&self) -> Result<MutexGuard<'_, Backend>, SessionError> {
        match self.backend.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(SessionError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Make `identity` the attached adapter at `weight`, or detach when `None`.
    /// Waits for any in-flight generation.
    pub fn apply_adapter(
        &self,
        identity: Option<&AdapterIdentity>,
        weight: f32,
    ) -> Result<(), SessionError> {
        let mut backend = self.lock_backend();
        self.apply_adapter_locked(&mut backend, identity, weight)
    }

    fn apply_adapter_locked(
        &self,
        backend: &mut Backend,
        identity: Option<&AdapterIdentity>,
        weight: f32,
    ) -> Result<(), SessionError> {
        let current = self.active_adapter();

        let Some(identity) = identity else {
            if let Some(active) = current {
                tracing::info!("Detaching adapter {}", active.identity);
                backend
                    .detach_adapter()
                    .map_err(|e| SessionError::AdapterLoad {
                        adapter: active.identity.to_string(),
                        reason: reason(&e),
                    })?;
                *self.active_slot() = None;
            }
            return Ok(());
        };

        if let Some(active) = current.as_ref().filter(|a| &a.identity == identity) {
            if active.weight != weight {
                tracing::info!("Adapter {} weight {} -> {}", identity, active.weight, weight);
            }
            self.set_weight(backend, identity, weight)?;
            return Ok(());
        }

        // Checked at call time: the file may have vanished since it was listed
        let source = self.registry.resolve(identity);
        if !source.is_file() {
            return Err(SessionError::AdapterNotFound(identity.to_string()));
        }

        if let Some(active) = current {
            tracing::info!("Detaching adapter {}", active.identity);
            backend
                .detach_adapter()
                .map_err(|e| SessionError::AdapterLoad {
                    adapter: active.identity.to_string(),
                    reason: reason(&e),
                })?;
            *self.active_slot() = None;
        }

        tracing::info!("Attaching adapter {} from {}", identity, source.display());
        backend
            .attach_adapter(&source, identity.as_str())
            .map_err(|e| {
                tracing::error!("Failed to attach adapter {}: {:#}", identity, e);
                SessionError::AdapterLoad {
                    adapter: identity.to_string(),
                    reason: reason(&e),
                }
            })?;
        *self.active_slot() = Some(ActiveAdapter {
            identity: identity.clone(),
            weight: 1.0,
        });

        self.set_weight(backend, identity, weight)
    }

    fn set_weight(
        &self,
        backend: &mut Backend,
        identity: &AdapterIdentity,
        weight: f32,
    ) -> Result<(), SessionError> {
        backend
            .set_adapter_weight(identity.as_str(), weight)
            .map_err(|e| SessionError::AdapterLoad {
                adapter: identity.to_string(),
                reason: reason(&e),
            })?;
        if let Some(active) = self.active_slot().as_mut() {
            active.weight = weight;
        }
        Ok(())
    }

    /// Run a request, waiting for any in-flight one to finish first
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, SessionError> {
        check_prompt(request)?;
        let backend = self.lock_backend();
        self.run(backend, request)
    }

    /// Run a request, or fail with [`SessionError::Busy`] if one is in flight
    pub fn try_generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, SessionError> {
        check_prompt(request)?;
        let backend = self.try_lock_backend()?;
        self.run(backend, request)
    }

    fn run(
        &self,
        backend: MutexGuard<'_, Backend>,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, SessionError> {
        let seed = resolve_seed(request.seed);
        let mut flight = Flight::start(backend, &self.generating);

        self.apply_adapter_locked(
            &mut flight.backend,
            request.adapter.as_ref(),
            request.adapter_weight,
        )?;

        tracing::info!(
            "Gen: '{}' | Steps: {} | Seed: {} | {}x{}",
            request.prompt,
            request.steps,
            seed,
            request.width,
            request.height
        );

        let params = InferenceParams::new(
            request.prompt.clone(),
            request.steps,
            request.width,
            request.height,
            seed as u64,
        );

        let start = Instant::now();
        let generated = flight.backend.infer(&params).map_err(|e| {
            tracing::error!("Generation failed: {:#}", e);
            SessionError::GenerationFailed(reason(&e))
        })?;
        let duration_seconds = start.elapsed().as_secs_f64();

        let image = generated
            .into_rgb_image()
            .map_err(|e| SessionError::GenerationFailed(reason(&e)))?;

        drop(flight);

        let saved_path = self.writer.save(&image, seed, &Local::now())?;
        tracing::info!("Done in {:.2}s (seed {})", duration_seconds, seed);

        Ok(GenerationResult {
            image,
            seed_used: seed,
            duration_seconds,
            saved_path,
        })
    }
}

fn check_prompt(request: &GenerationRequest) -> Result<(), SessionError> {
    if request.prompt.trim().is_empty() {
        return Err(SessionError::InvalidRequest(
            "Please enter a prompt.".to_string(),
        ));
    }
    Ok(())
}

/// Random draws are uniform over [0, 2^31 - 1]
fn resolve_seed(choice: SeedChoice) -> u32 {
    match choice {
        SeedChoice::Fixed(seed) => seed,
        SeedChoice::Random => rand::thread_rng().gen_range(0..=MAX_SEED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, MockBackend, MockLog};
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        session: Arc<GenerationSession>,
        log: Arc<Mutex<MockLog>>,
        dir: TempDir,
    }

    impl Fixture {
        fn with_backend(backend: MockBackend, log: Arc<Mutex<MockLog>>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir(dir.path().join("loras")).unwrap();
            let session = GenerationSession::new(
                Box::new(backend),
                AdapterRegistry::new(dir.path().join("loras")),
                OutputWriter::new(dir.path().join("outputs")).unwrap(),
            );
            Self {
                session: Arc::new(session),
                log,
                dir,
            }
        }

        fn new() -> Self {
            let (backend, log) = MockBackend::new();
            Self::with_backend(backend, log)
        }

        fn add_adapter(&self, name: &str) -> AdapterIdentity {
            fs::write(self.dir.path().join("loras").join(name), b"weights").unwrap();
            AdapterIdentity::new(name)
        }

        fn events(&self) -> Vec<Event> {
            self.log.lock().unwrap().events.clone()
        }

        fn clear_events(&self) {
            self.log.lock().unwrap().events.clear();
        }
    }

    fn request(prompt: &str, seed: SeedChoice) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            steps: 8,
            seed,
            width: 64,
            height: 64,
            adapter: None,
            adapter_weight: 1.0,
        }
    }

    #[test]
    fn test_red_cube_end_to_end() {
        let fx = Fixture::new();
        let req = GenerationRequest {
            width: 1024,
            height: 1024,
            ..request("a red cube", SeedChoice::Fixed(42))
        };

        let result = fx.session.generate(&req).unwrap();
        assert_eq!(result.seed_used, 42);
        assert_eq!(result.image.dimensions(), (1024, 1024));
        assert!(result.saved_path.exists());

        let name = result.saved_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("Z-Image_"), "{}", name);
        assert!(name.ends_with("_seed42.png"), "{}", name);
        // Z-Image_YYYYmmdd-HHMMSS_seed42.png
        assert_eq!(name.len(), "Z-Image_".len() + 15 + "_seed42.png".len());

        assert!(result.status_line().starts_with("Done in "));
        assert_eq!(fx.session.state(), SessionState::Idle);

        let events = fx.events();
        assert_eq!(
            events,
            vec![
                Event::Infer {
                    seed: 42,
                    guidance_scale: 0.0,
                    max_sequence_length: 1024
                },
                Event::ReleaseScratch,
            ]
        );
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let a = Fixture::new();
        let b = Fixture::new();
        let req = request("a lighthouse at dusk", SeedChoice::Fixed(1234));

        let first = a.session.generate(&req).unwrap();
        let second = b.session.generate(&req).unwrap();
        assert_eq!(first.image, second.image);
        assert_eq!(first.seed_used, second.seed_used);

        let other = b
            .session
            .generate(&request("a lighthouse at dusk", SeedChoice::Fixed(1235)))
            .unwrap();
        assert_ne!(first.image, other.image);
    }

    #[test]
    fn test_random_seed_is_reported_and_varies() {
        let fx = Fixture::new();
        let mut seeds = Vec::new();
        for _ in 0..8 {
            let result = fx
                .session
                .generate(&request("noise", SeedChoice::Random))
                .unwrap();
            assert!(result.seed_used <= MAX_SEED);
            seeds.push(result.seed_used);
        }
        seeds.sort();
        seeds.dedup();
        assert!(seeds.len() > 1);

        // The reported seed reproduces the image
        let replay_fx = Fixture::new();
        let original = fx
            .session
            .generate(&request("noise again", SeedChoice::Random))
            .unwrap();
        let replay = replay_fx
            .session
            .generate(&request("noise again", SeedChoice::Fixed(original.seed_used)))
            .unwrap();
        assert_eq!(original.image, replay.image);
    }

    #[test]
    fn test_same_adapter_twice_reloads_once() {
        let fx = Fixture::new();
        let style = fx.add_adapter("style.safetensors");

        fx.session.apply_adapter(Some(&style), 0.8).unwrap();
        fx.session.apply_adapter(Some(&style), 0.8).unwrap();
        fx.session.apply_adapter(Some(&style), 1.5).unwrap();

        let log = fx.log.lock().unwrap();
        assert_eq!(log.reloads(), 1);
        assert_eq!(log.attached, Some(("style.safetensors".to_string(), 1.5)));
        drop(log);

        assert_eq!(
            fx.session.active_adapter(),
            Some(ActiveAdapter {
                identity: style,
                weight: 1.5
            })
        );
    }

    #[test]
    fn test_swap_detaches_before_attaching() {
        let fx = Fixture::new();
        let a = fx.add_adapter("a.safetensors");
        let b = fx.add_adapter("b.safetensors");

        fx.session.apply_adapter(Some(&a), 1.0).unwrap();
        fx.session.apply_adapter(Some(&b), 0.5).unwrap();

        assert_eq!(
            fx.events(),
            vec![
                Event::Attach("a.safetensors".into()),
                Event::SetWeight("a.safetensors".into(), 1.0),
                Event::Detach,
                Event::Attach("b.safetensors".into()),
                Event::SetWeight("b.safetensors".into(), 0.5),
            ]
        );
        assert!(!fx.log.lock().unwrap().overlap);
        assert_eq!(fx.session.active_adapter().unwrap().identity, b);
    }

    #[test]
    fn test_none_detaches_once() {
        let fx = Fixture::new();
        let a = fx.add_adapter("a.safetensors");

        fx.session.apply_adapter(None, 1.0).unwrap();
        assert!(fx.events().is_empty());

        fx.session.apply_adapter(Some(&a), 1.0).unwrap();
        fx.clear_events();

        fx.session.apply_adapter(None, 1.0).unwrap();
        fx.session.apply_adapter(None, 1.0).unwrap();
        assert_eq!(fx.events(), vec![Event::Detach]);
        assert_eq!(fx.session.active_adapter(), None);
    }

    #[test]
    fn test_missing_adapter_leaves_state_unchanged() {
        let fx = Fixture::new();
        let req = GenerationRequest {
            adapter: Some(AdapterIdentity::new("style.safetensors")),
            ..request("a red cube", SeedChoice::Fixed(42))
        };

        let err = fx.session.generate(&req).unwrap_err();
        assert!(matches!(err, SessionError::AdapterNotFound(ref name) if name == "style.safetensors"));
        assert_eq!(fx.session.active_adapter(), None);
        assert_eq!(fx.log.lock().unwrap().infers(), 0);
        assert_eq!(fx.session.state(), SessionState::Idle);

        // With an adapter active, a missing one does not detach it
        let a = fx.add_adapter("a.safetensors");
        fx.session.apply_adapter(Some(&a), 0.7).unwrap();
        fx.clear_events();

        assert!(matches!(
            fx.session.generate(&req),
            Err(SessionError::AdapterNotFound(_))
        ));
        assert_eq!(fx.events(), vec![Event::ReleaseScratch]);
        assert_eq!(
            fx.session.active_adapter(),
            Some(ActiveAdapter {
                identity: a,
                weight: 0.7
            })
        );
        assert!(fs::read_dir(fx.session.writer().dir()).is_err());
    }

    #[test]
    fn test_adapter_removed_after_listing() {
        let fx = Fixture::new();
        let style = fx.add_adapter("style.safetensors");
        assert_eq!(fx.session.registry().list(), vec![style.clone()]);

        fs::remove_file(fx.session.registry().resolve(&style)).unwrap();
        assert!(matches!(
            fx.session.apply_adapter(Some(&style), 1.0),
            Err(SessionError::AdapterNotFound(_))
        ));
    }

    #[test]
    fn test_failed_attach_leaves_model_detached() {
        let fx = Fixture::new();
        let a = fx.add_adapter("a.safetensors");
        let broken = fx.add_adapter("broken.safetensors");
        fx.log.lock().unwrap().fail_attach.push("broken.safetensors".into());

        fx.session.apply_adapter(Some(&a), 1.0).unwrap();
        fx.clear_events();

        let req = GenerationRequest {
            adapter: Some(broken),
            ..request("x", SeedChoice::Fixed(1))
        };
        let err = fx.session.generate(&req).unwrap_err();
        assert!(matches!(err, SessionError::AdapterLoad { .. }));
        assert!(err.to_string().contains("cannot parse"));

        assert_eq!(
            fx.events(),
            vec![
                Event::Detach,
                Event::Attach("broken.safetensors".into()),
                Event::ReleaseScratch,
            ]
        );
        assert_eq!(fx.session.active_adapter(), None);
        assert_eq!(fx.log.lock().unwrap().attached, None);
    }

    #[test]
    fn test_inference_failure_returns_to_idle() {
        let fx = Fixture::new();
        fx.log.lock().unwrap().fail_infer = Some("CUDA out of memory".into());

        let err = fx
            .session
            .generate(&request("x", SeedChoice::Fixed(3)))
            .unwrap_err();
        match err {
            SessionError::GenerationFailed(reason) => assert!(reason.contains("out of memory")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fx.session.state(), SessionState::Idle);
        assert_eq!(fx.events().last(), Some(&Event::ReleaseScratch));

        fx.log.lock().unwrap().fail_infer = None;
        assert!(fx.session.generate(&request("x", SeedChoice::Fixed(3))).is_ok());
    }

    #[test]
    fn test_blank_prompt_never_reaches_backend() {
        let fx = Fixture::new();
        let err = fx
            .session
            .generate(&request("  ", SeedChoice::Random))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)));
        assert!(fx.events().is_empty());
    }

    #[test]
    fn test_adapter_state_feeds_inference() {
        let plain_fx = Fixture::new();
        let plain = plain_fx
            .session
            .generate(&request("cat", SeedChoice::Fixed(9)))
            .unwrap();

        let fx = Fixture::new();
        let style = fx.add_adapter("style.safetensors");
        let styled_req = GenerationRequest {
            adapter: Some(style),
            adapter_weight: 0.6,
            ..request("cat", SeedChoice::Fixed(9))
        };
        let styled = fx.session.generate(&styled_req).unwrap();
        assert_ne!(plain.image, styled.image);

        // Dropping the adapter from the request detaches it
        let again = fx.session.generate(&request("cat", SeedChoice::Fixed(10))).unwrap();
        assert_eq!(again.seed_used, 10);
        assert_eq!(fx.session.active_adapter(), None);
        assert_eq!(fx.log.lock().unwrap().attached, None);
    }

    #[test]
    fn test_second_request_waits_or_is_busy() {
        let (backend, log, gate) = MockBackend::gated();
        let fx = Fixture::with_backend(backend, log);

        let session = fx.session.clone();
        let first = std::thread::spawn(move || {
            session.generate(&request("first", SeedChoice::Fixed(1)))
        });
        gate.entered.recv().unwrap();
        assert_eq!(fx.session.state(), SessionState::Generating);

        assert!(matches!(
            fx.session.try_generate(&request("rejected", SeedChoice::Fixed(2))),
            Err(SessionError::Busy)
        ));

        let session = fx.session.clone();
        let second = std::thread::spawn(move || {
            session.generate(&request("second", SeedChoice::Fixed(3)))
        });
        // Second is queued behind the lock, not inside the backend
        assert!(gate.entered.recv_timeout(Duration::from_millis(200)).is_err());

        gate.release.send(()).unwrap();
        assert_eq!(first.join().unwrap().unwrap().seed_used, 1);

        gate.entered.recv().unwrap();
        gate.release.send(()).unwrap();
        assert_eq!(second.join().unwrap().unwrap().seed_used, 3);

        let infers: Vec<Event> = fx
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Infer { .. } | Event::ReleaseScratch))
            .collect();
        assert_eq!(
            infers,
            vec![
                Event::Infer {
                    seed: 1,
                    guidance_scale: 0.0,
                    max_sequence_length: 1024
                },
                Event::ReleaseScratch,
                Event::Infer {
                    seed: 3,
                    guidance_scale: 0.0,
                    max_sequence_length: 1024
                },
                Event::ReleaseScratch,
            ]
        );
        assert_eq!(fx.session.state(), SessionState::Idle);
    }
}
