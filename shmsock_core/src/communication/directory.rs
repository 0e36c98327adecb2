// In-process watchable directory
use super::rendezvous::{join, RendezvousDirectory, Watch};
use crate::error::{ShmsockError, ShmsockResult};
use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct WatchEntry {
    id: u64,
    path: String,
    sender: Sender<String>,
}

#[derive(Default)]
struct Tree {
    values: BTreeMap<String, String>,
    watches: Vec<WatchEntry>,
}

impl Tree {
    fn subtree_keys(&self, path: &str) -> Vec<String> {
        self.values
            .range(path.to_string()..)
            .take_while(|(k, _)| k.starts_with(path))
            .filter(|(k, _)| is_within(k, path))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn exists(&self, path: &str) -> bool {
        !self.subtree_keys(path).is_empty()
    }

    fn remove_subtree(&mut self, path: &str) -> bool {
        let keys = self.subtree_keys(path);
        for key in &keys {
            self.values.remove(key);
        }
        !keys.is_empty()
    }

    /// Send `changed` to every watch at, above or below it
    fn fire(&mut self, changed: &str) {
        self.watches.retain(|w| {
            if !related(&w.path, changed) {
                return true;
            }
            w.sender.send(changed.to_string()).is_ok()
        });
    }
}

fn related(watched: &str, changed: &str) -> bool {
    is_within(changed, watched) || is_within(watched, changed)
}

/// True when `path` equals `root` or lies below it
fn is_within(path: &str, root: &str) -> bool {
    path == root
        || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

fn check_path(path: &str) -> ShmsockResult<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(ShmsockError::AddressInvalid(format!(
            "Malformed directory path '{}'",
            path
        )));
    }
    Ok(())
}

/// [`RendezvousDirectory`] held in process memory
///
/// Every endpoint attached to the same instance shares one namespace. All
/// operations take a single lock, so each of them is atomic with respect to
/// the others.
#[derive(Default)]
pub struct MemDirectory {
    tree: Mutex<Tree>,
    next_watch: AtomicU64,
}

impl MemDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of paths holding a value
    pub fn len(&self) -> usize {
        self.tree.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn watch_count(&self) -> usize {
        self.tree.lock().watches.len()
    }
}

impl fmt::Debug for MemDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = self.tree.lock();
        f.debug_struct("MemDirectory")
            .field("entries", &tree.values.len())
            .field("watches", &tree.watches.len())
            .finish()
    }
}

impl RendezvousDirectory for MemDirectory {
    fn write(&self, path: &str, value: &str) -> ShmsockResult<()> {
        check_path(path)?;
        let mut tree = self.tree.lock();
        tree.values.insert(path.to_string(), value.to_string());
        tree.fire(path);
        Ok(())
    }

    fn read(&self, path: &str) -> ShmsockResult<Option<String>> {
        check_path(path)?;
        Ok(self.tree.lock().values.get(path).cloned())
    }

    fn exists(&self, dir: &str, key: &str) -> ShmsockResult<bool> {
        let path = join(dir, key);
        check_path(&path)?;
        Ok(self.tree.lock().exists(&path))
    }

    fn list(&self, dir: &str) -> ShmsockResult<Vec<String>> {
        check_path(dir)?;
        let prefix = format!("{}/", dir);
        let tree = self.tree.lock();
        let children: BTreeSet<String> = tree
            .values
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| k[prefix.len()..].split('/').next().map(str::to_string))
            .collect();
        Ok(children.into_iter().collect())
    }

    fn remove(&self, dir: &str, key: &str) -> ShmsockResult<bool> {
        let path = join(dir, key);
        check_path(&path)?;
        let mut tree = self.tree.lock();
        let removed = tree.remove_subtree(&path);
        if removed {
            tree.fire(&path);
        }
        Ok(removed)
    }

    fn publish_if_absent(&self, path: &str, value: &str) -> ShmsockResult<bool> {
        check_path(path)?;
        let mut tree = self.tree.lock();
        if tree.exists(path) {
            return Ok(false);
        }
        tree.values.insert(path.to_string(), value.to_string());
        tree.fire(path);
        Ok(true)
    }

    fn publish_child(&self, dir: &str, key: &str, value: &str) -> ShmsockResult<bool> {
        let path = join(dir, key);
        check_path(dir)?;
        check_path(&path)?;
        let mut tree = self.tree.lock();
        if !tree.values.contains_key(dir) {
            return Ok(false);
        }
        tree.values.insert(path.clone(), value.to_string());
        tree.fire(&path);
        Ok(true)
    }

    fn take(&self, path: &str) -> ShmsockResult<Option<String>> {
        check_path(path)?;
        let mut tree = self.tree.lock();
        let value = match tree.values.get(path) {
            Some(value) => value.clone(),
            None => return Ok(None),
        };
        tree.remove_subtree(path);
        tree.fire(path);
        Ok(Some(value))
    }

    fn watch(&self, path: &str) -> ShmsockResult<Watch> {
        check_path(path)?;
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded();
        // Initial event so the watcher scans current state before sleeping
        let _ = sender.send(path.to_string());
        self.tree.lock().watches.push(WatchEntry {
            id,
            path: path.to_string(),
            sender,
        });
        Ok(Watch::new(id, path, receiver))
    }

    fn unwatch(&self, watch: Watch) -> ShmsockResult<()> {
        let mut tree = self.tree.lock();
        let before = tree.watches.len();
        tree.watches.retain(|w| w.id != watch.id());
        if tree.watches.len() == before {
            return Err(ShmsockError::invalid_state(format!(
                "Watch {} on {} is not registered",
                watch.id(),
                watch.path()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn test_write_read_remove_subtree() {
        let dir = MemDirectory::new();
        dir.write("/ns/service/echo", "7").unwrap();
        dir.write("/ns/service/echo/12", "9").unwrap();
        dir.write("/ns/service/echoes", "3").unwrap();

        assert_eq!(dir.read("/ns/service/echo").unwrap().as_deref(), Some("7"));
        assert_eq!(dir.list("/ns/service").unwrap(), vec!["echo", "echoes"]);
        assert_eq!(dir.list("/ns/service/echo").unwrap(), vec!["12"]);

        assert!(dir.remove("/ns/service", "echo").unwrap());
        assert!(!dir.exists("/ns/service", "echo").unwrap());
        // Sibling sharing the prefix survives
        assert!(dir.exists("/ns/service", "echoes").unwrap());
        assert!(!dir.remove("/ns/service", "echo").unwrap());
    }

    #[test]
    fn test_intermediate_paths_exist() {
        let dir = MemDirectory::new();
        dir.write("/a/b/c", "x").unwrap();
        assert!(dir.exists("/a", "b").unwrap());
        assert_eq!(dir.read("/a/b").unwrap(), None);
        assert!(!dir.publish_if_absent("/a/b", "y").unwrap());
    }

    #[test]
    fn test_publish_if_absent() {
        let dir = MemDirectory::new();
        assert!(dir.publish_if_absent("/ns/service/echo", "").unwrap());
        assert!(!dir.publish_if_absent("/ns/service/echo", "5").unwrap());
        assert_eq!(dir.read("/ns/service/echo").unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_publish_child_requires_parent_value() {
        let dir = MemDirectory::new();
        assert!(!dir.publish_child("/ns/service/echo", "7", "2").unwrap());
        assert!(dir.is_empty());

        // A parent that only exists through its children does not count
        dir.write("/ns/service/echo/5", "3").unwrap();
        assert!(!dir.publish_child("/ns/service/echo", "7", "2").unwrap());

        dir.write("/ns/service/echo", "1").unwrap();
        assert!(dir.publish_child("/ns/service/echo", "7", "2").unwrap());
        assert_eq!(dir.read("/ns/service/echo/7").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_watch_fires_initially_and_on_children() {
        let dir = MemDirectory::new();
        let watch = dir.watch("/ns/service/echo").unwrap();
        assert_eq!(watch.next(SHORT).unwrap().as_deref(), Some("/ns/service/echo"));
        assert_eq!(watch.next(SHORT).unwrap(), None);

        dir.write("/ns/service/echo/3", "1").unwrap();
        assert_eq!(watch.next(SHORT).unwrap().as_deref(), Some("/ns/service/echo/3"));

        // Removing an ancestor is reported too
        dir.remove("/ns/service", "echo").unwrap();
        assert_eq!(watch.next(SHORT).unwrap().as_deref(), Some("/ns/service/echo"));

        // Unrelated paths are not
        dir.write("/ns/service/other", "1").unwrap();
        assert_eq!(watch.next(SHORT).unwrap(), None);

        dir.unwatch(watch).unwrap();
        assert_eq!(dir.watch_count(), 0);
    }

    #[test]
    fn test_take_is_exactly_once() {
        let dir = MemDirectory::new();
        for round in 0..50 {
            let path = format!("/ns/service/echo/{}", round);
            dir.write(&path, "4").unwrap();

            let winners: usize = (0..4)
                .map(|_| {
                    let dir = Arc::clone(&dir);
                    let path = path.clone();
                    thread::spawn(move || dir.take(&path).unwrap().is_some())
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum();
            assert_eq!(winners, 1);
        }
        assert!(dir.is_empty());
    }

    #[test]
    fn test_malformed_paths_rejected() {
        let dir = MemDirectory::new();
        assert!(dir.write("relative", "x").is_err());
        assert!(dir.write("/trailing/", "x").is_err());
        assert!(dir.read("/double//slash").is_err());
    }
}
