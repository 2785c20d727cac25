use crate::cache::lock::lock_cache_location;
use crate::cache::registry::FingerprintRegistry;
use crate::cache::state::{load_state, save_state};
use crate::cache::storage::{ArchiveStorage, CacheStorage};
use crate::cache::{CacheError, CacheKey, cache_location, open_storage, resolve_cache_key};
use crate::config::{CacheBackend, CompileConfig};
use crate::context::CompilationContext;
use crate::pass::{PassError, PassOrchestrator, PassRegistry};
use onnx_fuse_graph::{Graph, GraphError};
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum CompilerError {
    #[error(transparent)]
    PassError(#[from] PassError),
    #[error(transparent)]
    CacheError(#[from] CacheError),
    #[error(transparent)]
    GraphError(#[from] GraphError),
}

/// Result of one compile: the context the passes produced (or restored from
/// cache) and how it was obtained.
///
/// On a miss the graph handed to [`Compiler::compile`] is replaced by the rewritten
/// one. On a hit it is left exactly as given: the cached context already carries the
/// fused subgraphs and constants, so callers lower from `context.meta_defs()` rather
/// than from the graph.
#[derive(Debug)]
pub struct CompiledProgram {
    pub context: CompilationContext,
    pub cache_key: CacheKey,
    pub cache_hit: bool,
    pub passes_run: usize,
    /// A pass failed and the graph was left as it was given.
    pub fell_back: bool,
}

pub struct Compiler {
    passes: PassRegistry,
    fingerprints: FingerprintRegistry,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(PassRegistry::with_builtin_passes(), FingerprintRegistry::default())
    }
}

impl Compiler {
    pub fn new(passes: PassRegistry, fingerprints: FingerprintRegistry) -> Self {
        Self { passes, fingerprints }
    }

    /// Uses the registry file named by the config, if any.
    pub fn from_config(passes: PassRegistry, config: &CompileConfig) -> Result<Self, CompilerError> {
        let fingerprints = match &config.fingerprint.registry_path {
            Some(path) => FingerprintRegistry::from_json_file(path)?,
            None => FingerprintRegistry::default(),
        };
        Ok(Self::new(passes, fingerprints))
    }

    pub fn passes(&self) -> &PassRegistry {
        &self.passes
    }

    pub fn passes_mut(&mut self) -> &mut PassRegistry {
        &mut self.passes
    }

    pub fn fingerprints(&self) -> &FingerprintRegistry {
        &self.fingerprints
    }

    /// Runs the configured passes over `graph`, or restores their result from the
    /// cache. The graph is only replaced when every pass succeeds.
    pub fn compile(&self, graph: &mut Graph, config: &CompileConfig) -> Result<CompiledProgram, CompilerError> {
        let start = Instant::now();
        if graph.needs_resolve() {
            graph.resolve()?;
        }
        let cache_key = resolve_cache_key(graph, config, &self.fingerprints)?;
        log::debug!("Cache key {} (from {})", cache_key.key, cache_key.source);

        let location = cache_location(config, &cache_key);
        let _guard = lock_cache_location(&location);
        let mut storage = self.open_storage(config, &cache_key);

        if config.enable_cache {
            match load_state(storage.as_ref(), config) {
                Ok(Some(context)) => {
                    log::info!("Cache hit for {} in {:?}", cache_key.key, start.elapsed());
                    return Ok(CompiledProgram {
                        context,
                        cache_key,
                        cache_hit: true,
                        passes_run: 0,
                        fell_back: false,
                    });
                }
                Ok(None) => log::info!("Cache miss for {}", cache_key.key),
                Err(err) => log::warn!("Ignoring unusable cache entry for {}: {err}", cache_key.key),
            }
        }

        let mut context = CompilationContext::new(config, &cache_key.key);
        let mut working = graph.clone();
        let passes_run = match PassOrchestrator::new(&self.passes).run(&mut working, &mut context, &config.passes) {
            Ok(count) => count,
            Err(err) if config.skip_on_fatal => {
                log::warn!("Compilation failed, keeping the original graph: {err}");
                return Ok(CompiledProgram {
                    context: CompilationContext::new(config, &cache_key.key),
                    cache_key,
                    cache_hit: false,
                    passes_run: 0,
                    fell_back: true,
                });
            }
            Err(err) => return Err(err.into()),
        };
        *graph = working;

        if config.enable_cache {
            if let Err(err) = save_state(storage.as_mut(), &mut context, config) {
                log::warn!("Unable to persist compilation state for {}: {err}", cache_key.key);
            }
        }
        log::info!("Compiled {} with {passes_run} passes in {:?}", graph.name(), start.elapsed());
        Ok(CompiledProgram {
            context,
            cache_key,
            cache_hit: false,
            passes_run,
            fell_back: false,
        })
    }

    /// Falls back to an empty archive when the existing one cannot be read, so the
    /// compile proceeds as a miss and overwrites it.
    fn open_storage(&self, config: &CompileConfig, key: &CacheKey) -> Box<dyn CacheStorage> {
        match open_storage(config, key) {
            Ok(storage) => storage,
            Err(err) => {
                log::warn!("Unreadable cache storage for {}: {err}", key.key);
                let archive = match &config.cache_backend {
                    CacheBackend::Archive { path, compress } => ArchiveStorage::in_memory(*compress).persisted_at(path),
                    CacheBackend::Directory => ArchiveStorage::in_memory(false),
                };
                Box::new(archive.scoped(&key.key))
            }
        }
    }
}
