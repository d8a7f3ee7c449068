//! QPU kernel images
//!
//! Kernels are opaque machine code supplied as `.qhex` text: 32-bit words
//! separated by commas or whitespace, with `//` line comments.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{io_context, ForgeResult, QpuForgeError};

/// Every kernel image the runtime can dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelId {
    Sgemm,
    SgemmSingle,
    SgemmTransposed,
    SgemmTransposedSingle,
    Scopy,
    ScopySingle,
    Somatcopy,
    SomatcopySingle,
    Sabs,
    SabsSingle,
}

impl KernelId {
    pub const ALL: [KernelId; 10] = [
        KernelId::Sgemm,
        KernelId::SgemmSingle,
        KernelId::SgemmTransposed,
        KernelId::SgemmTransposedSingle,
        KernelId::Scopy,
        KernelId::ScopySingle,
        KernelId::Somatcopy,
        KernelId::SomatcopySingle,
        KernelId::Sabs,
        KernelId::SabsSingle,
    ];

    /// File stem of the image (`<stem>.qhex`)
    pub fn stem(self) -> &'static str {
        match self {
            KernelId::Sgemm => "sgemm",
            KernelId::SgemmSingle => "sgemm_1th",
            KernelId::SgemmTransposed => "sgemm_tt",
            KernelId::SgemmTransposedSingle => "sgemm_tt_1th",
            KernelId::Scopy => "scopy",
            KernelId::ScopySingle => "scopy_1th",
            KernelId::Somatcopy => "somatcopy",
            KernelId::SomatcopySingle => "somatcopy_1th",
            KernelId::Sabs => "sabs",
            KernelId::SabsSingle => "sabs_1th",
        }
    }

    /// Image path exported by the build script, if one was found at build time
    pub fn build_path(self) -> Option<&'static str> {
        match self {
            KernelId::Sgemm => option_env!("QPUFORGE_SGEMM_QHEX"),
            KernelId::SgemmSingle => option_env!("QPUFORGE_SGEMM_1TH_QHEX"),
            KernelId::SgemmTransposed => option_env!("QPUFORGE_SGEMM_TT_QHEX"),
            KernelId::SgemmTransposedSingle => option_env!("QPUFORGE_SGEMM_TT_1TH_QHEX"),
            KernelId::Scopy => option_env!("QPUFORGE_SCOPY_QHEX"),
            KernelId::ScopySingle => option_env!("QPUFORGE_SCOPY_1TH_QHEX"),
            KernelId::Somatcopy => option_env!("QPUFORGE_SOMATCOPY_QHEX"),
            KernelId::SomatcopySingle => option_env!("QPUFORGE_SOMATCOPY_1TH_QHEX"),
            KernelId::Sabs => option_env!("QPUFORGE_SABS_QHEX"),
            KernelId::SabsSingle => option_env!("QPUFORGE_SABS_1TH_QHEX"),
        }
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// Machine code of one kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    id: KernelId,
    words: Vec<u32>,
}

impl KernelImage {
    pub fn new(id: KernelId, words: Vec<u32>) -> ForgeResult<Self> {
        if words.is_empty() {
            return Err(QpuForgeError::KernelImageInvalid {
                name: id.stem().to_string(),
                reason: "image is empty".to_string(),
            });
        }
        Ok(Self { id, words })
    }

    /// Parse `.qhex` text
    pub fn parse(id: KernelId, text: &str) -> ForgeResult<Self> {
        let mut words = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let code = line.split("//").next().unwrap_or("");
            for token in code.split(|c: char| c == ',' || c.is_whitespace()) {
                if token.is_empty() {
                    continue;
                }
                let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => token.parse::<u32>(),
                };
                let word = parsed.map_err(|e| QpuForgeError::KernelImageInvalid {
                    name: id.stem().to_string(),
                    reason: format!("line {}: bad word '{}': {}", lineno + 1, token, e),
                })?;
                words.push(word);
            }
        }
        Self::new(id, words)
    }

    pub fn load(id: KernelId, path: &Path) -> ForgeResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| io_context(e, &format!("reading kernel image {}", path.display())))?;
        let image = Self::parse(id, &text)?;
        tracing::debug!(
            "KernelImage::load: {} ({} words) from {}",
            id,
            image.words.len(),
            path.display()
        );
        Ok(image)
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn code_bytes(&self) -> usize {
        self.words.len() * 4
    }
}

/// Set of kernel images available to a runtime
#[derive(Debug, Clone, Default)]
pub struct KernelLibrary {
    images: BTreeMap<KernelId, KernelImage>,
}

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `<stem>.qhex` present in `dir`
    ///
    /// Missing files are skipped; a kernel family reports the missing image
    /// when it is initialized. Files that exist but do not parse are errors.
    pub fn from_dir(dir: &Path) -> ForgeResult<Self> {
        let mut library = Self::new();
        for id in KernelId::ALL {
            let path = dir.join(format!("{}.qhex", id.stem()));
            if path.is_file() {
                library.insert(KernelImage::load(id, &path)?);
            } else {
                tracing::debug!("KernelLibrary::from_dir: {} not present", path.display());
            }
        }
        Ok(library)
    }

    /// Load the images located by the build script
    pub fn from_build_env() -> ForgeResult<Self> {
        let mut library = Self::new();
        for id in KernelId::ALL {
            if let Some(path) = id.build_path() {
                library.insert(KernelImage::load(id, Path::new(path))?);
            }
        }
        Ok(library)
    }

    pub fn insert(&mut self, image: KernelImage) {
        self.images.insert(image.id(), image);
    }

    pub fn get(&self, id: KernelId) -> ForgeResult<&KernelImage> {
        self.images
            .get(&id)
            .ok_or_else(|| QpuForgeError::KernelImageMissing(id.stem().to_string()))
    }

    pub fn contains(&self, id: KernelId) -> bool {
        self.images.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Largest code size among `ids`; every id must be present
    pub fn max_code_bytes(&self, ids: &[KernelId]) -> ForgeResult<usize> {
        let mut max = 0;
        for id in ids {
            max = max.max(self.get(*id)?.code_bytes());
        }
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_qhex() {
        let text = "// sgemm\n0x00000000, 0xe0024c67, // nop\n  0x10020827,\n42\n";
        let image = KernelImage::parse(KernelId::Sgemm, text).unwrap();
        assert_eq!(image.words(), &[0, 0xe002_4c67, 0x1002_0827, 42]);
        assert_eq!(image.code_bytes(), 16);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = KernelImage::parse(KernelId::Scopy, "0x1, zz").unwrap_err();
        assert!(matches!(err, QpuForgeError::KernelImageInvalid { .. }));
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_empty_image_is_invalid() {
        assert!(KernelImage::parse(KernelId::Sabs, "// nothing here\n").is_err());
    }

    #[test]
    fn test_library_from_dir_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("scopy_1th.qhex")).unwrap();
        writeln!(file, "0x1, 0x2, 0x3").unwrap();

        let library = KernelLibrary::from_dir(dir.path()).unwrap();
        assert_eq!(library.len(), 1);
        assert!(library.contains(KernelId::ScopySingle));
        assert!(matches!(
            library.get(KernelId::Scopy),
            Err(QpuForgeError::KernelImageMissing(_))
        ));
    }

    #[test]
    fn test_max_code_bytes() {
        let mut library = KernelLibrary::new();
        library.insert(KernelImage::new(KernelId::Sgemm, vec![0; 8]).unwrap());
        library.insert(KernelImage::new(KernelId::SgemmSingle, vec![0; 3]).unwrap());
        assert_eq!(
            library
                .max_code_bytes(&[KernelId::Sgemm, KernelId::SgemmSingle])
                .unwrap(),
            32
        );
        assert!(library.max_code_bytes(&[KernelId::Sabs]).is_err());
    }
}
