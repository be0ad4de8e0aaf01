use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::fleet::tasks::GeneratedPage;

/// Destination for pages produced by frontend tasks. Publication is a
/// best-effort side effect; callers log failures and move on.
pub trait PageSink: Send + Sync {
    /// Returns the number of pages actually written.
    fn publish(&self, agent_id: &str, pages: &[GeneratedPage]) -> Result<usize>;
}

/// Drops everything; used when no output directory is configured.
pub struct NullPageSink;

impl PageSink for NullPageSink {
    fn publish(&self, _agent_id: &str, pages: &[GeneratedPage]) -> Result<usize> {
        if !pages.is_empty() {
            tracing::debug!("Page sink disabled; dropping {} page(s)", pages.len());
        }
        Ok(0)
    }
}

/// Writes generated pages under a fixed root directory.
pub struct FsPageSink {
    root: PathBuf,
}

impl FsPageSink {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Resolve a page path inside the root. Absolute paths and parent
    /// traversal are rejected.
    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let relative = Path::new(raw);
        if relative.is_absolute() {
            anyhow::bail!("Absolute page path rejected: {}", raw);
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => anyhow::bail!("Page path escapes output directory: {}", raw),
            }
        }
        Ok(self.root.join(relative))
    }
}

impl PageSink for FsPageSink {
    fn publish(&self, agent_id: &str, pages: &[GeneratedPage]) -> Result<usize> {
        let mut written = 0;
        for page in pages {
            let target = match self.resolve(&page.path) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Skipping page from {}: {}", agent_id, e);
                    continue;
                }
            };
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
            fs::write(&target, &page.content)
                .with_context(|| format!("Failed to write page {:?}", target))?;
            written += 1;
        }
        if written > 0 {
            tracing::info!("Published {} page(s) from {}", written, agent_id);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn page(path: &str) -> GeneratedPage {
        GeneratedPage {
            path: path.to_string(),
            content: "export const Page = () => null;".to_string(),
        }
    }

    #[test]
    fn writes_pages_under_root() {
        let dir = tempdir().unwrap();
        let sink = FsPageSink::new(dir.path());

        let written = sink
            .publish("frontend-agent-1", &[page("rates/OverviewPage.tsx")])
            .unwrap();
        assert_eq!(written, 1);
        assert!(dir.path().join("rates/OverviewPage.tsx").exists());
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        let dir = tempdir().unwrap();
        let sink = FsPageSink::new(dir.path());

        let written = sink
            .publish(
                "frontend-agent-1",
                &[page("../escape.tsx"), page("/etc/evil.tsx"), page("ok.tsx")],
            )
            .unwrap();
        assert_eq!(written, 1);
        assert!(dir.path().join("ok.tsx").exists());
        assert!(!dir.path().parent().unwrap().join("escape.tsx").exists());
    }

    #[test]
    fn null_sink_writes_nothing() {
        let sink = NullPageSink;
        assert_eq!(sink.publish("frontend-agent-1", &[page("x.tsx")]).unwrap(), 0);
    }
}
