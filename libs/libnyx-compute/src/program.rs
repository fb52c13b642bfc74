//! Programs: kernel source compiled lazily per context

use crate::cache::{Owned, ResourceCache};
use crate::computer::Computer;
use crate::config::{ComputeConfig, DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_SOURCE_LEN};
use crate::error::{ComputeError, Result};
use crate::handle::{ContextId, ProgramId};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Read kernel source from disk
///
/// Fails when the file is missing or longer than `max_len` bytes.
pub fn load_program_source(path: &Path, max_len: usize) -> Result<String> {
    let load_error = |reason: String| ComputeError::ProgramLoad {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| load_error(e.to_string()))?;
    if metadata.len() > max_len as u64 {
        return Err(load_error(format!(
            "source is {} bytes, limit is {}",
            metadata.len(),
            max_len
        )));
    }

    let source = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
    if source.len() > max_len {
        return Err(load_error(format!("source exceeds {} bytes", max_len)));
    }

    Ok(source)
}

/// Logical program: source text plus one compiled program per context
pub struct Program {
    source: String,
    build_options: String,
    cache: ResourceCache<ContextId, Owned<ProgramId>>,
}

impl Program {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            build_options: String::new(),
            cache: ResourceCache::new(DEFAULT_CACHE_CAPACITY),
        }
    }

    /// Load source with the default length limit
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = load_program_source(path.as_ref(), DEFAULT_MAX_SOURCE_LEN)?;
        Ok(Self::from_source(source))
    }

    /// Load source using the limits, cache capacity and build options in `config`
    pub fn load_with(path: impl AsRef<Path>, config: &ComputeConfig) -> Result<Self> {
        let source = load_program_source(path.as_ref(), config.max_source_len)?;
        Ok(Self::from_source(source)
            .with_cache_capacity(config.cache_capacity)
            .with_build_options(config.build_options.clone()))
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = ResourceCache::new(capacity);
        self
    }

    pub fn with_build_options(mut self, options: impl Into<String>) -> Self {
        self.build_options = options.into();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn build_options(&self) -> &str {
        &self.build_options
    }

    /// Compiled program for `computer`, building it on first use
    ///
    /// A failed build leaves no entry behind; the next call builds again.
    pub fn build(&mut self, computer: &Computer) -> Result<ProgramId> {
        let context = computer.context()?;
        let driver = computer.driver();
        let source = &self.source;
        let options = &self.build_options;

        let program = self.cache.get_or_create(context, || {
            let program = Owned::new(driver.create_program(context, source)?, driver.clone());
            driver.build_program(program.handle(), options)?;
            debug!("Built {:?} for {:?}", program.handle(), context);
            Ok(program)
        })?;

        Ok(program.handle())
    }

    /// Compiled program for `computer`, if already built
    pub fn compiled(&self, computer: &Computer) -> Option<ProgramId> {
        let context = computer.context().ok()?;
        self.cache.lookup(&context).map(Owned::handle)
    }

    /// Number of contexts this program has been built for
    pub fn cached_contexts(&self) -> usize {
        self.cache.len()
    }

    /// Release every compiled program, returning the released ids
    ///
    /// Kernel objects created inside them are not released here; pass the
    /// ids to [`Kernel::forget`](crate::kernel::Kernel::forget).
    pub fn clear(&mut self) -> Vec<ProgramId> {
        let released = self.cache.values().map(Owned::handle).collect();
        self.cache.clear();
        released
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("source_len", &self.source.len())
            .field("build_options", &self.build_options)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SOURCE: &str = "__kernel void fill(__global int* a) { a[get_global_id(0)] = 1; }";

    #[test]
    fn test_load_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.cl");
        std::fs::write(&path, SOURCE).unwrap();

        let program = Program::load(&path).unwrap();
        assert_eq!(program.source(), SOURCE);
        assert_eq!(program.cached_contexts(), 0);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = Program::load(dir.path().join("missing.cl"));
        assert!(matches!(result, Err(ComputeError::ProgramLoad { .. })));
    }

    #[test]
    fn test_load_oversized_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.cl");
        std::fs::write(&path, SOURCE).unwrap();

        let config = ComputeConfig {
            max_source_len: 8,
            ..ComputeConfig::default()
        };
        match Program::load_with(&path, &config) {
            Err(ComputeError::ProgramLoad { path: p, reason }) => {
                assert_eq!(p, path);
                assert!(reason.contains("limit is 8"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_load_with_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.cl");
        std::fs::write(&path, SOURCE).unwrap();

        let config = ComputeConfig {
            build_options: "-DN=4".into(),
            ..ComputeConfig::default()
        };
        let program = Program::load_with(&path, &config).unwrap();
        assert_eq!(program.build_options(), "-DN=4");
    }
}
