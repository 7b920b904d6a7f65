/// Image datasets laid out as one subdirectory per class
use std::fs;
use std::path::{Path, PathBuf};

use crate::{EvalError, Result};

/// One encoded image and its class label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub bytes: Vec<u8>,
    pub label: u32,
}

/// Random-access source of encoded samples
///
/// Implementations must be cheap to share across the prefetch threads.
pub trait SampleSource: Send + Sync {
    /// Number of samples
    fn len(&self) -> usize;

    /// Number of distinct classes
    fn num_classes(&self) -> usize;

    /// Read the sample at `index` (0 <= index < len)
    fn read(&self, index: usize) -> std::io::Result<Sample>;

    /// Human-readable identity of a sample, used in data-quality logs
    fn describe(&self, index: usize) -> String {
        format!("sample #{}", index)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct FileRecord {
    path: PathBuf,
    label: u32,
}

/// Dataset read from `root/<class>/<file>`
///
/// Classes are the sorted subdirectory names; label `i` is the i-th class.
/// Files inside a class are sorted by name, so sample order is reproducible
/// across ranks and runs.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    records: Vec<FileRecord>,
}

impl ImageFolder {
    /// Scan a dataset root
    ///
    /// # Arguments
    /// * `root` - Directory containing one subdirectory per class
    ///
    /// # Returns
    /// The indexed dataset, or a configuration error when the root is missing
    /// or holds no samples
    pub fn from_directory<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(EvalError::Configuration(format!(
                "dataset path {} does not exist or is not a directory",
                root.display()
            )));
        }

        log::info!("Scanning image folder: {:?}", root);

        let mut class_dirs: Vec<(String, PathBuf)> = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            class_dirs.push((name, entry.path()));
        }
        class_dirs.sort();

        let mut classes = Vec::with_capacity(class_dirs.len());
        let mut records = Vec::new();
        for (label, (name, dir)) in class_dirs.into_iter().enumerate() {
            let mut files: Vec<PathBuf> = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                files.push(entry.path());
            }
            files.sort();

            records.extend(files.into_iter().map(|path| FileRecord {
                path,
                label: label as u32,
            }));
            classes.push(name);
        }

        if records.is_empty() {
            return Err(EvalError::Configuration(format!(
                "dataset path {} contains no samples",
                root.display()
            )));
        }

        log::info!(
            "Dataset indexed: {} samples across {} classes",
            records.len(),
            classes.len()
        );

        Ok(Self {
            root: root.to_path_buf(),
            classes,
            records,
        })
    }

    /// Dataset root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Class names in label order
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Path of the sample at `index`
    pub fn path(&self, index: usize) -> Option<&Path> {
        self.records.get(index).map(|r| r.path.as_path())
    }
}

impl SampleSource for ImageFolder {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn num_classes(&self) -> usize {
        self.classes.len()
    }

    fn read(&self, index: usize) -> std::io::Result<Sample> {
        let record = self.records.get(index).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("sample index {} out of range", index),
            )
        })?;
        Ok(Sample {
            bytes: fs::read(&record.path)?,
            label: record.label,
        })
    }

    fn describe(&self, index: usize) -> String {
        match self.records.get(index) {
            Some(record) => record.path.display().to_string(),
            None => format!("sample #{}", index),
        }
    }
}

/// Dataset held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
    num_classes: usize,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        let num_classes = samples
            .iter()
            .map(|s| s.label as usize + 1)
            .max()
            .unwrap_or(0);
        Self {
            samples,
            num_classes,
        }
    }
}

impl SampleSource for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn read(&self, index: usize) -> std::io::Result<Sample> {
        self.samples.get(index).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("sample index {} out of range", index),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_labels_follow_sorted_class_names() {
        let dir = tempfile::tempdir().unwrap();
        for (class, files) in [("zebra", vec!["b.png", "a.png"]), ("ant", vec!["x.png"])] {
            let class_dir = dir.path().join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for file in files {
                fs::write(class_dir.join(file), file.as_bytes()).unwrap();
            }
        }
        fs::write(dir.path().join("README"), b"not a class").unwrap();

        let folder = ImageFolder::from_directory(dir.path()).unwrap();
        assert_eq!(folder.classes(), &["ant".to_string(), "zebra".to_string()]);
        assert_eq!(folder.len(), 3);
        assert_eq!(folder.num_classes(), 2);

        let first = folder.read(0).unwrap();
        assert_eq!(first.label, 0);
        assert_eq!(first.bytes, b"x.png");

        let second = folder.read(1).unwrap();
        assert_eq!(second.label, 1);
        assert_eq!(second.bytes, b"a.png");
    }

    #[test]
    fn test_missing_root_is_configuration_error() {
        let result = ImageFolder::from_directory("/no/such/dataset");
        assert!(matches!(result, Err(EvalError::Configuration(_))));
    }

    #[test]
    fn test_empty_root_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("only_class")).unwrap();
        assert!(matches!(
            ImageFolder::from_directory(dir.path()),
            Err(EvalError::Configuration(_))
        ));
    }

    #[test]
    fn test_in_memory_class_count() {
        let ds = InMemoryDataset::new(vec![
            Sample { bytes: vec![1], label: 0 },
            Sample { bytes: vec![2], label: 4 },
        ]);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.num_classes(), 5);
        assert!(ds.read(2).is_err());
    }
}
