use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::sync::Arc;

/// 打开的数据流，以及可选的总字节数
///
/// 总字节数未知时 (例如 URL 资源没有 Content-Length)，只在开始和结束时汇报进度。
pub struct SourceStream {
    pub reader: Box<dyn Read + Send>,
    pub total_len: Option<u64>,
}

/// 解码线程读取原始字节的来源
///
/// 实现必须是 `Send + Sync`，因为它会被移动到解码线程中。
pub trait AssetSource: Send + Sync {
    fn open(&self, path: &str) -> io::Result<SourceStream>;
}

/// 从文件系统读取
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSource;

impl AssetSource for FileSource {
    fn open(&self, path: &str) -> io::Result<SourceStream> {
        let file = File::open(path)?;
        let total_len = file.metadata().ok().map(|m| m.len());
        Ok(SourceStream {
            reader: Box::new(file),
            total_len,
        })
    }
}

/// 内存中的 path -> bytes 表
///
/// 用于测试，以及自己负责下载字节的嵌入方。
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    entries: HashMap<String, Arc<[u8]>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.entries.insert(path.into(), bytes.into());
    }

    pub fn with(mut self, path: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.insert(path, bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AssetSource for MemorySource {
    fn open(&self, path: &str) -> io::Result<SourceStream> {
        let bytes = self
            .entries
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no in-memory asset named {path}")))?;
        let total_len = Some(bytes.len() as u64);
        Ok(SourceStream {
            reader: Box::new(Cursor::new(bytes)),
            total_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_reports_length() {
        let source = MemorySource::new().with("a.hdr", vec![1u8, 2, 3]);
        let mut stream = source.open("a.hdr").unwrap();
        assert_eq!(stream.total_len, Some(3));

        let mut bytes = Vec::new();
        stream.reader.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, [1, 2, 3]);
    }

    #[test]
    fn test_missing_entries_are_not_found() {
        let err = MemorySource::new().open("missing.hdr").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_file_source_reads_metadata_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.hdr");
        std::fs::write(&path, b"#?RADIANCE\n").unwrap();

        let stream = FileSource.open(path.to_str().unwrap()).unwrap();
        assert_eq!(stream.total_len, Some(11));
    }
}
