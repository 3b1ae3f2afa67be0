//! Function documents and where they come from
//!
//! Parsing is done by whoever implements [`DocumentSource`]; the engine only
//! sees the parsed functions. Parsed documents are cached by machine, file and
//! modification time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::actions::function::FunctionDefinition;
use crate::errors::FetchError;

/// The functions defined by one file
#[derive(Debug, Clone)]
pub struct FunctionDocument {
    pub machine: String,
    pub file: String,
    /// Function called when the document is run as a job
    pub default_function: Option<String>,
    pub functions: BTreeMap<String, Arc<FunctionDefinition>>,
}

impl FunctionDocument {
    pub fn new(machine: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            file: file.into(),
            default_function: None,
            functions: BTreeMap::new(),
        }
    }

    pub fn with_default_function(mut self, name: impl Into<String>) -> Self {
        self.default_function = Some(name.into());
        self
    }

    pub fn with_function(mut self, function: FunctionDefinition) -> Self {
        self.functions
            .insert(function.name.clone(), Arc::new(function));
        self
    }
}

/// Fetches and parses definition files on a machine
pub trait DocumentSource: Send + Sync {
    /// Modification time of a file, as an opaque comparable string
    fn modification_time(&self, machine: &str, file: &str) -> Result<String, FetchError>;

    fn fetch(&self, machine: &str, file: &str) -> Result<Arc<FunctionDocument>, FetchError>;

    /// Full paths of the entries in `directory` with the given extension
    fn list_directory(
        &self,
        machine: &str,
        directory: &str,
        extension: &str,
    ) -> Result<Vec<String>, FetchError>;

    fn is_case_sensitive(&self, _machine: &str) -> bool {
        true
    }

    fn file_separator(&self, _machine: &str) -> char {
        '/'
    }
}

/// Cache of parsed documents
pub trait FileCache: Send + Sync {
    fn get(&self, machine: &str, file: &str, case_sensitive: bool) -> Option<Arc<FunctionDocument>>;

    fn put(
        &self,
        machine: &str,
        file: &str,
        modified: &str,
        document: Arc<FunctionDocument>,
        case_sensitive: bool,
    );

    fn invalidate(&self, machine: &str, file: &str, case_sensitive: bool);

    /// The cached document if it was cached for exactly `modified`
    fn check_freshness(
        &self,
        machine: &str,
        file: &str,
        modified: &str,
        case_sensitive: bool,
    ) -> Option<Arc<FunctionDocument>>;
}

fn cache_key(machine: &str, file: &str, case_sensitive: bool) -> (String, String) {
    let file = if case_sensitive {
        file.to_string()
    } else {
        file.to_lowercase()
    };
    (machine.to_lowercase(), file)
}

struct CacheEntry {
    modified: String,
    document: Arc<FunctionDocument>,
    last_used: u64,
}

#[derive(Default)]
struct LruState {
    entries: HashMap<(String, String), CacheEntry>,
    tick: u64,
}

/// Size-bounded cache evicting the least recently used document
pub struct LruFileCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl LruFileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileCache for LruFileCache {
    fn get(&self, machine: &str, file: &str, case_sensitive: bool) -> Option<Arc<FunctionDocument>> {
        let mut state = self.state.lock().ok()?;
        state.tick += 1;
        let tick = state.tick;

        let entry = state.entries.get_mut(&cache_key(machine, file, case_sensitive))?;
        entry.last_used = tick;
        Some(entry.document.clone())
    }

    fn put(
        &self,
        machine: &str,
        file: &str,
        modified: &str,
        document: Arc<FunctionDocument>,
        case_sensitive: bool,
    ) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.tick += 1;
        let tick = state.tick;

        state.entries.insert(
            cache_key(machine, file, case_sensitive),
            CacheEntry {
                modified: modified.to_string(),
                document,
                last_used: tick,
            },
        );

        while state.entries.len() > self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    state.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    fn invalidate(&self, machine: &str, file: &str, case_sensitive: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.remove(&cache_key(machine, file, case_sensitive));
        }
    }

    fn check_freshness(
        &self,
        machine: &str,
        file: &str,
        modified: &str,
        case_sensitive: bool,
    ) -> Option<Arc<FunctionDocument>> {
        let mut state = self.state.lock().ok()?;
        state.tick += 1;
        let tick = state.tick;

        let entry = state.entries.get_mut(&cache_key(machine, file, case_sensitive))?;
        if entry.modified != modified {
            return None;
        }
        entry.last_used = tick;
        Some(entry.document.clone())
    }
}

/// Load a document, going through the cache when one is configured
pub fn load_document(
    source: &dyn DocumentSource,
    cache: Option<&dyn FileCache>,
    machine: &str,
    file: &str,
) -> Result<Arc<FunctionDocument>, FetchError> {
    let case_sensitive = source.is_case_sensitive(machine);

    let Some(cache) = cache else {
        return source.fetch(machine, file);
    };

    let modified = source.modification_time(machine, file)?;

    if let Some(document) = cache.check_freshness(machine, file, &modified, case_sensitive) {
        tracing::trace!(machine, file, "Using cached document");
        return Ok(document);
    }

    let document = source.fetch(machine, file)?;
    cache.put(machine, file, &modified, document.clone(), case_sensitive);
    Ok(document)
}

/// Documents held in memory, keyed by machine and path
///
/// Files registered with [`MemoryDocumentSource::fail`] report the given
/// error instead.
#[derive(Default)]
pub struct MemoryDocumentSource {
    files: Mutex<BTreeMap<(String, String), (String, Result<Arc<FunctionDocument>, FetchError>)>>,
    fetches: Mutex<Vec<String>>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: FunctionDocument, modified: impl Into<String>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(
                (document.machine.to_lowercase(), document.file.clone()),
                (modified.into(), Ok(Arc::new(document))),
            );
        }
    }

    pub fn fail(&self, machine: &str, file: &str, error: FetchError) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(
                (machine.to_lowercase(), file.to_string()),
                ("0".to_string(), Err(error)),
            );
        }
    }

    /// Files fetched so far, in order
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().map(|f| f.clone()).unwrap_or_default()
    }

    fn missing(machine: &str, file: &str) -> FetchError {
        FetchError::Copy {
            machine: machine.to_string(),
            file: file.to_string(),
            rc: crate::types::ResultCode::DOES_NOT_EXIST,
            message: format!("{} does not exist", file),
        }
    }
}

impl DocumentSource for MemoryDocumentSource {
    fn modification_time(&self, machine: &str, file: &str) -> Result<String, FetchError> {
        let files = self
            .files
            .lock()
            .map_err(|_| Self::missing(machine, file))?;
        files
            .get(&(machine.to_lowercase(), file.to_string()))
            .map(|(modified, _)| modified.clone())
            .ok_or_else(|| Self::missing(machine, file))
    }

    fn fetch(&self, machine: &str, file: &str) -> Result<Arc<FunctionDocument>, FetchError> {
        if let Ok(mut fetches) = self.fetches.lock() {
            fetches.push(file.to_string());
        }

        let files = self
            .files
            .lock()
            .map_err(|_| Self::missing(machine, file))?;
        match files.get(&(machine.to_lowercase(), file.to_string())) {
            Some((_, result)) => result.clone(),
            None => Err(Self::missing(machine, file)),
        }
    }

    fn list_directory(
        &self,
        machine: &str,
        directory: &str,
        extension: &str,
    ) -> Result<Vec<String>, FetchError> {
        let prefix = format!("{}/", directory.trim_end_matches('/'));
        let suffix = format!(".{}", extension);
        let machine = machine.to_lowercase();

        let files = self
            .files
            .lock()
            .map_err(|_| Self::missing(&machine, directory))?;

        let entries: Vec<String> = files
            .keys()
            .filter(|(m, path)| {
                *m == machine
                    && path.starts_with(&prefix)
                    && path.ends_with(&suffix)
                    && !path[prefix.len()..].contains('/')
            })
            .map(|(_, path)| path.clone())
            .collect();

        if entries.is_empty() && !files.keys().any(|(m, path)| *m == machine && path.starts_with(&prefix)) {
            return Err(Self::missing(&machine, directory));
        }

        Ok(entries)
    }
}
