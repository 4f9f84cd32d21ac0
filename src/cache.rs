//! File-based content cache
//!
//! Every cached video is one file under the cache root, named
//! `<id>[_<description>]<ext>`. A download in progress lives in a temp file
//! `nltmp_<final name>` next to it and is committed with [`CacheEntry::store`].
//!
//! The store keeps three process-wide maps:
//! - id -> final file, rebuilt by scanning the root at startup
//! - id -> temp file, so a partial download survives a restart
//! - id -> expected size of a download currently in flight
//!
//! Map operations are individually atomic. Compound check-then-act sequences
//! across them (for example "is it in progress? then start") are best-effort.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use encoding_rs::Encoding;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Prefix of temp files in the cache root
pub const TEMP_PREFIX: &str = "nltmp_";

const TEMP_ID: &str = "nltmp";

/// Characters that cannot appear in a file name on common filesystems
const RESERVED: &[char] = &['\\', '/', ':', ',', ';', '*', '?', '"', '<', '>', '|'];

static CHAR_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(\d+);").expect("character reference regex"));

type Index<V> = RwLock<HashMap<String, V>>;

fn read<V: Clone>(index: &Index<V>, id: &str) -> Option<V> {
    index
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(id)
        .cloned()
}

fn insert<V>(index: &Index<V>, id: &str, value: V) {
    index
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.to_string(), value);
}

fn remove<V>(index: &Index<V>, id: &str) -> Option<V> {
    index
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(id)
}

/// Id part of a cache file name, if the name is one
///
/// `sm9.flv` and `sm9_Some title.flv` both give `sm9`; names ending in
/// `.tmp` or without an extension give `None`.
pub fn id_from_filename(name: &str) -> Option<&str> {
    let dot = name.rfind('.')?;
    let extension = &name[dot + 1..];
    if extension.is_empty() || extension == "tmp" {
        return None;
    }
    let stem = &name[..dot];
    let id = match stem.find('_') {
        Some(underscore) => &stem[..underscore],
        None => stem,
    };
    (!id.is_empty()).then_some(id)
}

/// Turn a free-form description into something usable in a file name
///
/// Numeric character references are decoded first, then the text is
/// optionally narrowed to `charset` (unrepresentable characters become `?`),
/// then reserved characters are replaced with `-`.
pub fn sanitize_description(description: &str, charset: Option<&'static Encoding>) -> String {
    let decoded = CHAR_REF_RE.replace_all(description, |caps: &regex::Captures| {
        caps[1]
            .parse::<u32>()
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });

    let narrowed = match charset {
        Some(encoding) => narrow_to_charset(&decoded, encoding),
        None => decoded.into_owned(),
    };

    narrowed
        .chars()
        .map(|c| if RESERVED.contains(&c) { '-' } else { c })
        .collect()
}

fn narrow_to_charset(text: &str, encoding: &'static Encoding) -> String {
    let mut narrowed = String::with_capacity(text.len());
    let mut utf8 = [0u8; 4];
    for c in text.chars() {
        let (bytes, _, had_errors) = encoding.encode(c.encode_utf8(&mut utf8));
        if had_errors {
            narrowed.push('?');
        } else {
            narrowed.push_str(&encoding.decode_without_bom_handling(&bytes).0);
        }
    }
    narrowed
}

/// Move `from` to `to`, falling back to copy-then-delete
///
/// The copy goes to a `.tmp` sibling first and is renamed into place, so a
/// failure never leaves a truncated final file. `from` is only removed once
/// `to` is complete.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    let mut partial = to.as_os_str().to_owned();
    partial.push(".tmp");
    let partial = PathBuf::from(partial);

    let copied = async {
        fs::copy(from, &partial).await?;
        fs::rename(&partial, to).await
    }
    .await;
    if let Err(e) = copied {
        let _ = fs::remove_file(&partial).await;
        return Err(e);
    }

    if let Err(e) = fs::remove_file(from).await {
        warn!("moved {} but could not remove it: {}", from.display(), e);
    }
    Ok(())
}

/// Cache root plus the id indexes
pub struct CacheStore {
    root: PathBuf,
    file_name_charset: Option<&'static Encoding>,
    files: Index<PathBuf>,
    temps: Index<PathBuf>,
    in_progress: Index<u64>,
}

impl CacheStore {
    /// Create a store rooted at `root`; call [`init`](Self::init) before use
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheStore {
            root: root.into(),
            file_name_charset: None,
            files: RwLock::new(HashMap::new()),
            temps: RwLock::new(HashMap::new()),
            in_progress: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store from the cache settings in `config`
    pub fn from_config(config: &ProxyConfig) -> Self {
        let mut store = Self::new(&config.cache_dir);
        store.file_name_charset = config
            .file_name_charset
            .as_deref()
            .and_then(|label| Encoding::for_label(label.as_bytes()));
        store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and rebuild the indexes from its contents
    ///
    /// Final files are picked up at any depth. Temp files are only
    /// recognised directly in the root.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            ProxyError::CacheError(format!(
                "cannot create cache dir {}: {}",
                self.root.display(),
                e
            ))
        })?;
        self.files.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.temps.write().unwrap_or_else(PoisonError::into_inner).clear();

        let mut pending = vec![(self.root.clone(), 1usize)];
        while let Some((dir, depth)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("cannot scan {}: {}", dir.display(), e);
                    continue;
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((path, depth + 1));
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(id) = id_from_filename(&name) else {
                    continue;
                };
                if depth == 1 && id == TEMP_ID {
                    if let Some(id) = id_from_filename(&name[TEMP_PREFIX.len()..]) {
                        debug!("partial cache found: {} => {}", id, path.display());
                        insert(&self.temps, id, path);
                    }
                } else {
                    debug!("cache found: {} => {}", id, path.display());
                    insert(&self.files, id, path);
                }
            }
        }
        Ok(())
    }

    /// Delete `*.tmp` leftovers of unfinished moves in the root
    ///
    /// Directories named `*.tmp` are removed only when empty.
    ///
    /// # Returns
    /// Number of entries removed
    pub async fn cleanup(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().ends_with(".tmp") {
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => debug!("left {} in place: {}", path.display(), e),
            }
        }
        Ok(removed)
    }

    /// Total length of all indexed final files
    pub async fn size(&self) -> u64 {
        let files: Vec<PathBuf> = self
            .files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut total = 0;
        for file in files {
            if let Ok(metadata) = fs::metadata(&file).await {
                total += metadata.len();
            }
        }
        total
    }

    pub fn entry_count(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Indexed final file for `id`
    pub fn known_file(&self, id: &str) -> Option<PathBuf> {
        read(&self.files, id)
    }

    /// Indexed temp file for `id`
    pub fn known_temp(&self, id: &str) -> Option<PathBuf> {
        read(&self.temps, id)
    }

    /// Whether a download of `id` is currently running
    pub fn is_in_progress(&self, id: &str) -> bool {
        read(&self.in_progress, id).is_some_and(|size| size > 0)
    }

    /// Mark a download of `id` as running with `expected_size` total bytes;
    /// a size of 0 clears the mark
    pub fn set_in_progress(&self, id: &str, expected_size: u64) {
        if expected_size > 0 {
            insert(&self.in_progress, id, expected_size);
        } else {
            remove(&self.in_progress, id);
        }
    }

    pub fn clear_in_progress(&self, id: &str) {
        if remove(&self.in_progress, id).is_none() {
            warn!("internal error: {} was not marked in progress", id);
        }
    }

    /// Open the cache entry for `id`
    ///
    /// An indexed final file wins; otherwise the file name is built from the
    /// id, the sanitized `description` and `extension`.
    pub fn open(
        self: &Arc<Self>,
        id: &str,
        extension: &str,
        description: Option<&str>,
    ) -> CacheEntry {
        let file = self
            .known_file(id)
            .unwrap_or_else(|| self.file_path(id, extension, description));
        CacheEntry {
            store: Arc::clone(self),
            id: id.to_string(),
            extension: extension.to_string(),
            file,
            temp: Mutex::new(None),
        }
    }

    pub fn sanitize(&self, description: &str) -> String {
        sanitize_description(description, self.file_name_charset)
    }

    fn file_path(&self, id: &str, extension: &str, description: Option<&str>) -> PathBuf {
        match description {
            Some(description) => self.root.join(format!(
                "{}_{}{}",
                id,
                self.sanitize(description),
                extension
            )),
            None => self.root.join(format!("{}{}", id, extension)),
        }
    }
}

/// One cacheable item and its temp file
pub struct CacheEntry {
    store: Arc<CacheStore>,
    id: String,
    extension: String,
    file: PathBuf,
    temp: Mutex<Option<PathBuf>>,
}

impl CacheEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store_handle(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Final file location
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.file)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    pub async fn len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.file).await?.len())
    }

    /// Set the final file's modification time to now
    pub async fn touch(&self) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(&self.file).await?;
        let file = file.into_std().await;
        tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
            .await
            .map_err(io::Error::other)?
    }

    /// Rename the final file after `description`
    pub fn describe(&mut self, description: &str) {
        self.file = self
            .store
            .file_path(&self.id, &self.extension, Some(description));
    }

    /// The temp file, created empty if needed
    ///
    /// A temp file already indexed for this id is reused so a download can
    /// resume across restarts.
    pub async fn temp_file(&self) -> io::Result<PathBuf> {
        let mut slot = self.temp.lock().await;
        self.resolve_temp(&mut slot).await
    }

    async fn resolve_temp(&self, slot: &mut Option<PathBuf>) -> io::Result<PathBuf> {
        let path = match slot.as_ref() {
            Some(path) => path.clone(),
            None => {
                let path = self.store.known_temp(&self.id).unwrap_or_else(|| {
                    self.store
                        .root
                        .join(format!("{}{}", TEMP_PREFIX, self.file_name()))
                });
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                *slot = Some(path.clone());
                path
            }
        };
        insert(&self.store.temps, &self.id, path.clone());
        Ok(path)
    }

    pub async fn temp_len(&self) -> io::Result<u64> {
        let path = self.temp_file().await?;
        Ok(fs::metadata(path).await?.len())
    }

    pub async fn open_temp_reader(&self) -> io::Result<fs::File> {
        fs::File::open(self.temp_file().await?).await
    }

    /// Open the temp file for writing, truncating unless `append`
    pub async fn open_temp_writer(&self, append: bool) -> io::Result<fs::File> {
        let path = self.temp_file().await?;
        let mut options = fs::OpenOptions::new();
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        options.open(path).await
    }

    /// Rename the temp file after `title`, keeping the index in step
    pub async fn describe_temp(&self, title: &str) -> io::Result<()> {
        let mut slot = self.temp.lock().await;
        let current = self.resolve_temp(&mut slot).await?;
        let renamed = self.store.root.join(format!(
            "{}{}_{}{}",
            TEMP_PREFIX,
            self.id,
            self.store.sanitize(title),
            self.extension
        ));
        if renamed == current {
            return Ok(());
        }

        move_file(&current, &renamed).await?;
        insert(&self.store.temps, &self.id, renamed.clone());
        *slot = Some(renamed);
        Ok(())
    }

    /// Commit the temp file as the final file
    ///
    /// A regular-quality file is placed next to an already cached `low`
    /// variant of the same id. On failure the temp file and the index are
    /// left as they were.
    pub async fn store(&mut self) -> Result<()> {
        let mut slot = self.temp.lock().await;
        let temp = self.resolve_temp(&mut slot).await?;

        let mut parent = self.store.root.clone();
        if !self.id.ends_with("low") {
            if let Some(low) = self.store.known_file(&format!("{}low", self.id)) {
                if let Some(dir) = low.parent() {
                    parent = dir.to_path_buf();
                }
            }
        }
        let target = parent.join(self.file_name());

        move_file(&temp, &target).await.map_err(|e| {
            ProxyError::CacheError(format!(
                "failed to store {} as {}: {}",
                temp.display(),
                target.display(),
                e
            ))
        })?;

        insert(&self.store.files, &self.id, target.clone());
        remove(&self.store.temps, &self.id);
        *slot = None;
        info!("cache stored: {}", target.display());
        self.file = target;
        Ok(())
    }

    /// Discard the temp file
    pub async fn delete_temp(&self) -> io::Result<()> {
        let mut slot = self.temp.lock().await;
        let temp = self.resolve_temp(&mut slot).await?;
        fs::remove_file(&temp).await?;
        remove(&self.store.temps, &self.id);
        *slot = None;
        Ok(())
    }
}
