use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

use crate::wikijs::{NewPage, PageStore};

/// Where one converted page lands under the export root. Page paths use
/// forward slashes; each segment becomes a directory level and the leaf
/// gets a markdown extension.
pub fn artifact_path(root: &Path, page_path: &str) -> Result<PathBuf> {
    let mut output = root.to_path_buf();
    for segment in page_path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            bail!("invalid page path segment in {page_path:?}");
        }
        output.push(segment);
    }
    output.set_extension("md");
    Ok(output)
}

/// Page store over a local directory tree. Gives out synthetic ids so the
/// driver can run the same create/update/delete lifecycle it uses against
/// the remote store.
pub struct DirStore {
    root: PathBuf,
    next_id: i64,
    paths_by_id: BTreeMap<i64, String>,
    ids_by_path: BTreeMap<String, i64>,
}

impl DirStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            next_id: 1,
            paths_by_id: BTreeMap::new(),
            ids_by_path: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn allocate(&mut self, page_path: &str) -> i64 {
        if let Some(id) = self.ids_by_path.get(page_path) {
            return *id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.paths_by_id.insert(id, page_path.to_string());
        self.ids_by_path.insert(page_path.to_string(), id);
        id
    }

    fn write(&self, page_path: &str, content: &str) -> Result<()> {
        let file = artifact_path(&self.root, page_path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&file, content).with_context(|| format!("failed to write {}", file.display()))
    }
}

impl PageStore for DirStore {
    fn find_page(&mut self, path: &str) -> Result<Option<i64>> {
        if let Some(id) = self.ids_by_path.get(path) {
            return Ok(Some(*id));
        }
        if artifact_path(&self.root, path)?.exists() {
            return Ok(Some(self.allocate(path)));
        }
        Ok(None)
    }

    fn delete_page(&mut self, id: i64) -> Result<()> {
        let page_path = self
            .paths_by_id
            .remove(&id)
            .with_context(|| format!("unknown page id {id}"))?;
        self.ids_by_path.remove(&page_path);
        let file = artifact_path(&self.root, &page_path)?;
        if file.exists() {
            fs::remove_file(&file)
                .with_context(|| format!("failed to remove {}", file.display()))?;
        }
        Ok(())
    }

    fn create_page(&mut self, page: &NewPage<'_>) -> Result<i64> {
        self.write(page.path, page.content)?;
        Ok(self.allocate(page.path))
    }

    fn update_page(&mut self, id: i64, content: &str) -> Result<()> {
        let page_path = self
            .paths_by_id
            .get(&id)
            .cloned()
            .with_context(|| format!("unknown page id {id}"))?;
        self.write(&page_path, content)
    }

    fn request_count(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub files: usize,
    pub total_bytes: u64,
}

/// Count the markdown artifacts under an export root.
pub fn scan_export_tree(root: &Path) -> Result<ExportStats> {
    let mut stats = ExportStats::default();
    if !root.exists() {
        return Ok(stats);
    }
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some("md") {
            continue;
        }
        stats.files += 1;
        let metadata = entry
            .metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        stats.total_bytes += metadata.len();
    }
    Ok(stats)
}
