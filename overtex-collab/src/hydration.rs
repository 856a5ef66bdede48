//! Seeding new documents from the project's files on disk.
//!
//! Hydration only ever fills empty sub-documents the delta log has never
//! seen. A file the log covers stays as the log left it, even when empty.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path};

use crate::replica::{Replica, TextEdit};

/// Extensions treated as editable text.
pub const EDITABLE_EXTENSIONS: &[&str] = &[
    "tex", "bib", "sty", "cls", "bst", "txt", "md", "csv", "dtx", "ins", "tikz",
];

/// File-storage collaborator.
pub trait FileStore: Send + Sync {
    /// Every editable text file under `project_path` as `(relative path, content)`.
    /// Relative paths use `/` separators.
    fn list_text_files(&self, project_path: &Path) -> Result<Vec<(String, String)>, HydrationError>;

    /// Write `content` to `relative_path` under `project_path`.
    fn save(&self, project_path: &Path, relative_path: &str, content: &str) -> Result<(), HydrationError>;
}

/// Hydration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum HydrationError {
    /// Project directory missing
    ProjectNotFound(String),
    Io(String),
    /// Relative path escapes the project root
    InvalidPath(String),
}

impl std::fmt::Display for HydrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProjectNotFound(p) => write!(f, "Project directory not found: {p}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidPath(p) => write!(f, "Invalid file path: {p}"),
        }
    }
}

impl std::error::Error for HydrationError {}

impl From<std::io::Error> for HydrationError {
    fn from(e: std::io::Error) -> Self {
        HydrationError::Io(e.to_string())
    }
}

pub fn is_editable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EDITABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// [`FileStore`] over a directory tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFileStore;

impl DiskFileStore {
    pub fn new() -> Self {
        Self
    }

    fn walk(
        root: &Path,
        dir: &Path,
        out: &mut Vec<(String, String)>,
    ) -> Result<(), HydrationError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                Self::walk(root, &path, out)?;
            } else if file_type.is_file() && is_editable(&path) {
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let relative: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                match fs::read_to_string(&path) {
                    Ok(content) => out.push((relative.join("/"), content)),
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        log::warn!("Skipping non-UTF-8 file {}", path.display());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

impl FileStore for DiskFileStore {
    fn list_text_files(&self, project_path: &Path) -> Result<Vec<(String, String)>, HydrationError> {
        if !project_path.is_dir() {
            return Err(HydrationError::ProjectNotFound(project_path.display().to_string()));
        }
        let mut files = Vec::new();
        Self::walk(project_path, project_path, &mut files)?;
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    fn save(&self, project_path: &Path, relative_path: &str, content: &str) -> Result<(), HydrationError> {
        let relative = Path::new(relative_path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if relative_path.is_empty() || escapes {
            return Err(HydrationError::InvalidPath(relative_path.to_string()));
        }

        let target = project_path.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
        Ok(())
    }
}

/// Seed every listed file whose sub-document is still empty and not in
/// `logged`.
///
/// Returns the seeding delta per file so it can be logged.
pub fn seed(
    replica: &mut Replica,
    files: Vec<(String, String)>,
    logged: &HashSet<String>,
) -> Vec<(String, Vec<u8>)> {
    let mut seeded = Vec::new();
    for (name, content) in files {
        if logged.contains(&name) {
            continue;
        }
        let sub_doc = replica.sub_doc(&name);
        if !sub_doc.is_empty() || content.is_empty() {
            continue;
        }
        match sub_doc.local_edit(&TextEdit::Insert { at: 0, text: content }) {
            Ok(Some(delta)) => seeded.push((name, delta)),
            Ok(None) => {}
            Err(e) => log::warn!("Failed to seed {name}: {e}"),
        }
    }
    seeded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.tex"), "\\begin{document}\\end{document}").unwrap();
        fs::create_dir(dir.path().join("chapters")).unwrap();
        fs::write(dir.path().join("chapters/intro.tex"), "Intro").unwrap();
        fs::write(dir.path().join("refs.BIB"), "@book{}").unwrap();
        fs::write(dir.path().join("figure.png"), [0u8, 159, 146, 150]).unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config.txt"), "hidden").unwrap();
        dir
    }

    #[test]
    fn test_list_text_files_recursive() {
        let dir = project();
        let files = DiskFileStore.list_text_files(dir.path()).unwrap();
        let names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["chapters/intro.tex", "main.tex", "refs.BIB"]);
        assert_eq!(files[0].1, "Intro");
    }

    #[test]
    fn test_missing_project() {
        let dir = tempfile::tempdir().unwrap();
        let err = DiskFileStore.list_text_files(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, HydrationError::ProjectNotFound(_)));
    }

    #[test]
    fn test_save_and_reject_escape() {
        let dir = tempfile::tempdir().unwrap();
        DiskFileStore.save(dir.path(), "sub/new.tex", "x").unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("sub/new.tex")).unwrap(), "x");
        assert!(matches!(
            DiskFileStore.save(dir.path(), "../evil.tex", "x"),
            Err(HydrationError::InvalidPath(_))
        ));
        assert!(DiskFileStore.save(dir.path(), "/abs.tex", "x").is_err());
    }

    #[test]
    fn test_seed_only_empty() {
        let mut replica = Replica::new();
        replica
            .sub_doc("main.tex")
            .local_edit(&TextEdit::Insert { at: 0, text: "live".into() })
            .unwrap();

        let seeded = seed(
            &mut replica,
            vec![
                ("main.tex".into(), "disk".into()),
                ("intro.tex".into(), "Intro".into()),
                ("empty.tex".into(), String::new()),
            ],
            &HashSet::new(),
        );
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].0, "intro.tex");
        assert_eq!(replica.get("main.tex").unwrap().text(), "live");
        assert_eq!(replica.get("intro.tex").unwrap().text(), "Intro");
        assert!(replica.contains("empty.tex"));
    }

    #[test]
    fn test_seed_idempotent() {
        let mut replica = Replica::new();
        let files = vec![("main.tex".to_string(), "abc".to_string())];
        seed(&mut replica, files.clone(), &HashSet::new());
        assert!(seed(&mut replica, files, &HashSet::new()).is_empty());
        assert_eq!(replica.get("main.tex").unwrap().text(), "abc");
    }

    #[test]
    fn test_seed_skips_logged_files() {
        let mut replica = Replica::new();
        let logged: HashSet<String> = ["main.tex".to_string()].into_iter().collect();
        let seeded = seed(
            &mut replica,
            vec![("main.tex".into(), "disk".into()), ("intro.tex".into(), "Intro".into())],
            &logged,
        );
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].0, "intro.tex");
        assert!(replica.get("main.tex").is_none());
    }

    #[test]
    fn test_is_editable() {
        assert!(is_editable(Path::new("a/b.tex")));
        assert!(is_editable(Path::new("notes.MD")));
        assert!(!is_editable(Path::new("a.pdf")));
        assert!(!is_editable(Path::new("Makefile")));
    }
}
