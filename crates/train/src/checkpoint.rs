//! Epoch checkpoints with bounded retention
//!
//! Each epoch writes `ckpt-<epoch>.safetensors` and updates a `checkpoint`
//! marker file holding the latest epoch number. Only the newest
//! `max_to_keep` checkpoint files are retained. Optimizer moments are not
//! serialized; resuming restarts the optimizer state at the recorded epoch.

use std::fs;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;

use ctc_asr_core::{Error, Result};

const MARKER_FILE: &str = "checkpoint";

pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Result<Self> {
        if max_to_keep == 0 {
            return Err(Error::Checkpoint(
                "max_to_keep must be at least 1".to_string(),
            ));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_to_keep })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("ckpt-{epoch}.safetensors"))
    }

    /// Checkpoints on disk, sorted by epoch ascending
    fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if let Some(epoch) = name
                .strip_prefix("ckpt-")
                .and_then(|rest| rest.strip_suffix(".safetensors"))
                .and_then(|n| n.parse::<usize>().ok())
            {
                found.push((epoch, path));
            }
        }
        found.sort_by_key(|(epoch, _)| *epoch);
        Ok(found)
    }

    /// Write the checkpoint for `epoch`, update the marker, prune old files.
    pub fn save(&self, varmap: &VarMap, epoch: usize) -> Result<PathBuf> {
        let path = self.path_for(epoch);
        varmap.save(&path)?;
        fs::write(self.dir.join(MARKER_FILE), format!("{epoch}\n"))?;
        self.prune()?;
        tracing::info!(epoch, path = %path.display(), "Saved checkpoint");
        Ok(path)
    }

    fn prune(&self) -> Result<()> {
        let checkpoints = self.list()?;
        if checkpoints.len() <= self.max_to_keep {
            return Ok(());
        }
        for (epoch, path) in &checkpoints[..checkpoints.len() - self.max_to_keep] {
            fs::remove_file(path)?;
            tracing::debug!(epoch, "Pruned checkpoint");
        }
        Ok(())
    }

    /// Latest epoch and its checkpoint path, if any exists.
    ///
    /// Prefers the marker file; falls back to scanning the directory when
    /// the marker is missing or stale.
    pub fn latest(&self) -> Result<Option<(usize, PathBuf)>> {
        let marker = self.dir.join(MARKER_FILE);
        if let Ok(contents) = fs::read_to_string(&marker) {
            match contents.trim().parse::<usize>() {
                Ok(epoch) => {
                    let path = self.path_for(epoch);
                    if path.is_file() {
                        return Ok(Some((epoch, path)));
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        path = %marker.display(),
                        "Unreadable checkpoint marker, scanning directory"
                    );
                }
            }
        }
        Ok(self.list()?.into_iter().last())
    }

    /// Load the latest checkpoint into `varmap`, returning its epoch
    pub fn restore(&self, varmap: &mut VarMap) -> Result<Option<usize>> {
        match self.latest()? {
            None => Ok(None),
            Some((epoch, path)) => {
                varmap.load(&path)?;
                tracing::info!(epoch, path = %path.display(), "Restored checkpoint");
                Ok(Some(epoch))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    fn varmap_with_var() -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 2), "w", Init::Const(1.0), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let varmap = varmap_with_var();
        for epoch in 1..=3 {
            manager.save(&varmap, epoch).unwrap();
        }
        assert!(!dir.path().join("ckpt-1.safetensors").exists());
        assert!(dir.path().join("ckpt-2.safetensors").exists());
        assert!(dir.path().join("ckpt-3.safetensors").exists());
        assert_eq!(manager.latest().unwrap().unwrap().0, 3);
    }

    #[test]
    fn test_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3).unwrap();

        let varmap = VarMap::new();
        let var = varmap
            .get((2, 2), "w", Init::Const(7.0), DType::F32, &Device::Cpu)
            .unwrap();
        manager.save(&varmap, 5).unwrap();
        drop(var);

        let mut fresh = VarMap::new();
        fresh
            .get((2, 2), "w", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        let epoch = manager.restore(&mut fresh).unwrap();
        assert_eq!(epoch, Some(5));

        let data = fresh.data().lock().unwrap();
        let restored = data.get("w").unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(restored, vec![vec![7.0, 7.0], vec![7.0, 7.0]]);
    }

    #[test]
    fn test_malformed_marker_falls_back_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let varmap = varmap_with_var();
        manager.save(&varmap, 4).unwrap();
        std::fs::write(dir.path().join("checkpoint"), "not-a-number\n").unwrap();
        assert_eq!(manager.latest().unwrap().unwrap().0, 4);
    }

    #[test]
    fn test_empty_dir_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), 2).unwrap();
        assert!(manager.latest().unwrap().is_none());
        let mut varmap = varmap_with_var();
        assert_eq!(manager.restore(&mut varmap).unwrap(), None);
    }
}
