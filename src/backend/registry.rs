//! Backend factory registry
//!
//! Process-wide list of backend factories, consulted in registration order.
//! Built-in factories are registered lazily on first use. After
//! [`BackendRegistry::shutdown`] the registry stays empty for the rest of
//! the process.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{BackendResult, EncoderBackend, RegistryError};
use crate::config::{EncoderConfig, PipelineSettings};
use crate::encoder::{EncodeError, EncodeResult, Encoder};

/// Creates backends for one or more codecs
pub trait BackendFactory: Send + Sync {
    /// Unique factory name
    fn name(&self) -> &'static str;

    /// Codec identifiers this factory can produce
    fn supported_codecs(&self) -> &[&'static str];

    /// Whether the backend can run on this machine
    ///
    /// Probed once, at registration.
    fn is_available(&self) -> bool {
        true
    }

    /// Create an uninitialized backend
    ///
    /// Called on the encode thread, which then owns the backend.
    fn create_backend(&self, codec: &str) -> BackendResult<Box<dyn EncoderBackend>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Active,
    ShutDown,
}

struct RegistryInner {
    lifecycle: Lifecycle,
    factories: Vec<Arc<dyn BackendFactory>>,
}

/// Ordered set of backend factories
pub struct BackendRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// Create an empty registry
    ///
    /// Built-ins are added on first use, as with the global registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                lifecycle: Lifecycle::Uninitialized,
                factories: Vec::new(),
            }),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static BackendRegistry {
        static GLOBAL: OnceLock<BackendRegistry> = OnceLock::new();
        GLOBAL.get_or_init(BackendRegistry::new)
    }

    /// Register the built-in factories if that has not happened yet
    ///
    /// Idempotent; does nothing after shutdown.
    pub fn ensure_builtins(&self) {
        if self.inner.read().lifecycle != Lifecycle::Uninitialized {
            return;
        }

        let mut inner = self.inner.write();
        if inner.lifecycle != Lifecycle::Uninitialized {
            return;
        }
        inner.lifecycle = Lifecycle::Active;

        for factory in builtin_factories() {
            if let Err(e) = Self::insert(&mut inner, factory) {
                debug!("Built-in factory skipped: {}", e);
            }
        }
        info!(
            "Backend registry initialized with {} factories",
            inner.factories.len()
        );
    }

    /// Add a factory after probing its availability
    pub fn register_factory(&self, factory: Arc<dyn BackendFactory>) -> Result<(), RegistryError> {
        self.ensure_builtins();
        let mut inner = self.inner.write();
        if inner.lifecycle == Lifecycle::ShutDown {
            return Err(RegistryError::ShutDown);
        }
        Self::insert(&mut inner, factory)
    }

    fn insert(
        inner: &mut RegistryInner,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<(), RegistryError> {
        let name = factory.name();
        if inner.factories.iter().any(|f| f.name() == name) {
            return Err(RegistryError::AlreadyRegistered {
                name: name.to_string(),
            });
        }
        if !factory.is_available() {
            warn!("Backend factory '{}' unavailable on this system", name);
            return Err(RegistryError::Unavailable {
                name: name.to_string(),
            });
        }

        debug!(
            "Registered backend factory '{}' ({:?})",
            name,
            factory.supported_codecs()
        );
        inner.factories.push(factory);
        Ok(())
    }

    /// Remove a factory by name
    pub fn unregister_factory(&self, name: &str) -> Result<(), RegistryError> {
        self.ensure_builtins();
        let mut inner = self.inner.write();
        if inner.lifecycle == Lifecycle::ShutDown {
            return Err(RegistryError::ShutDown);
        }

        let before = inner.factories.len();
        inner.factories.retain(|f| f.name() != name);
        if inner.factories.len() == before {
            return Err(RegistryError::NotRegistered {
                name: name.to_string(),
            });
        }
        debug!("Unregistered backend factory '{}'", name);
        Ok(())
    }

    /// First registered factory supporting `codec`
    pub fn find_factory(&self, codec: &str) -> Option<Arc<dyn BackendFactory>> {
        self.ensure_builtins();
        self.inner
            .read()
            .factories
            .iter()
            .find(|f| f.supported_codecs().iter().any(|c| *c == codec))
            .cloned()
    }

    /// Names of registered factories, in lookup order
    pub fn factory_names(&self) -> Vec<&'static str> {
        self.ensure_builtins();
        self.inner.read().factories.iter().map(|f| f.name()).collect()
    }

    /// Every codec some registered factory supports
    pub fn codecs(&self) -> Vec<&'static str> {
        self.ensure_builtins();
        let inner = self.inner.read();
        let mut codecs: Vec<&'static str> = Vec::new();
        for codec in inner
            .factories
            .iter()
            .flat_map(|f| f.supported_codecs().iter().copied())
        {
            if !codecs.contains(&codec) {
                codecs.push(codec);
            }
        }
        codecs
    }

    /// Drop every factory; nothing is registered again afterwards
    pub fn shutdown(&self) {
        let mut inner = self.inner.write();
        if inner.lifecycle == Lifecycle::ShutDown {
            return;
        }
        info!(
            "Backend registry shutting down ({} factories)",
            inner.factories.len()
        );
        inner.factories.clear();
        inner.lifecycle = Lifecycle::ShutDown;
    }

    /// Whether `shutdown` has run
    pub fn is_shut_down(&self) -> bool {
        self.inner.read().lifecycle == Lifecycle::ShutDown
    }

    /// Create an encoder from the first factory supporting `codec`
    pub fn create_encoder(
        &self,
        codec: &str,
        config: EncoderConfig,
        settings: PipelineSettings,
    ) -> EncodeResult<Encoder> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown.into());
        }
        let factory = self.find_factory(codec).ok_or_else(|| EncodeError::NoFactory {
            codec: codec.to_string(),
        })?;
        Encoder::new(factory, codec, config, settings)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("BackendRegistry")
            .field("lifecycle", &inner.lifecycle)
            .field(
                "factories",
                &inner.factories.iter().map(|f| f.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Factories compiled into this build, in preference order
fn builtin_factories() -> Vec<Arc<dyn BackendFactory>> {
    let mut factories: Vec<Arc<dyn BackendFactory>> = Vec::new();

    #[cfg(feature = "h264")]
    factories.push(Arc::new(super::openh264::OpenH264Factory::new()));

    factories.push(Arc::new(super::software::SoftwareFactory::new()));
    factories
}

/// Create an encoder for `codec` through the global registry
pub fn create_encoder(
    codec: &str,
    config: EncoderConfig,
    settings: PipelineSettings,
) -> EncodeResult<Encoder> {
    BackendRegistry::global().create_encoder(codec, config, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;

    struct NamedFactory {
        name: &'static str,
        codecs: &'static [&'static str],
        available: bool,
    }

    impl BackendFactory for NamedFactory {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supported_codecs(&self) -> &[&'static str] {
            self.codecs
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn create_backend(&self, codec: &str) -> BackendResult<Box<dyn EncoderBackend>> {
            Err(BackendError::UnsupportedCodec {
                codec: codec.to_string(),
            })
        }
    }

    fn factory(name: &'static str, codecs: &'static [&'static str]) -> Arc<dyn BackendFactory> {
        Arc::new(NamedFactory {
            name,
            codecs,
            available: true,
        })
    }

    #[test]
    fn test_builtins_registered_once() {
        let registry = BackendRegistry::new();
        registry.ensure_builtins();
        let names = registry.factory_names();
        registry.ensure_builtins();
        assert_eq!(registry.factory_names(), names);
        assert!(names.contains(&"software"));
    }

    #[test]
    fn test_first_registered_wins() {
        let registry = BackendRegistry::new();
        registry.register_factory(factory("vendor-a", &["av1"])).unwrap();
        registry.register_factory(factory("vendor-b", &["av1", "hevc"])).unwrap();

        assert_eq!(registry.find_factory("av1").unwrap().name(), "vendor-a");
        assert_eq!(registry.find_factory("hevc").unwrap().name(), "vendor-b");
        assert!(registry.find_factory("vp9").is_none());

        registry.unregister_factory("vendor-a").unwrap();
        assert_eq!(registry.find_factory("av1").unwrap().name(), "vendor-b");
    }

    #[test]
    fn test_duplicate_and_unknown_rejected() {
        let registry = BackendRegistry::new();
        registry.register_factory(factory("vendor", &["av1"])).unwrap();
        assert_eq!(
            registry.register_factory(factory("vendor", &["hevc"])),
            Err(RegistryError::AlreadyRegistered {
                name: "vendor".to_string()
            })
        );
        assert_eq!(
            registry.unregister_factory("missing"),
            Err(RegistryError::NotRegistered {
                name: "missing".to_string()
            })
        );
    }

    #[test]
    fn test_unavailable_factory_not_registered() {
        let registry = BackendRegistry::new();
        let result = registry.register_factory(Arc::new(NamedFactory {
            name: "absent-gpu",
            codecs: &["h265"],
            available: false,
        }));
        assert!(matches!(result, Err(RegistryError::Unavailable { .. })));
        assert!(registry.find_factory("h265").is_none());
    }

    #[test]
    fn test_shutdown_is_final() {
        let registry = BackendRegistry::new();
        registry.ensure_builtins();
        registry.shutdown();

        assert!(registry.find_factory("rle").is_none());
        registry.ensure_builtins();
        assert!(registry.factory_names().is_empty());
        assert_eq!(
            registry.register_factory(factory("late", &["av1"])),
            Err(RegistryError::ShutDown)
        );
        assert!(matches!(
            registry.create_encoder("rle", EncoderConfig::default(), PipelineSettings::default()),
            Err(EncodeError::Registry(RegistryError::ShutDown))
        ));
    }

    #[test]
    fn test_create_encoder_without_factory() {
        let registry = BackendRegistry::new();
        let result =
            registry.create_encoder("vp9", EncoderConfig::default(), PipelineSettings::default());
        assert!(matches!(result, Err(EncodeError::NoFactory { .. })));
    }
}
