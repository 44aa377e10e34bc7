use klocks::SpinMutex;

/// 页可以从中读回内容的文件
pub trait BackingFile: Send + Sync {
    /// 从 `offset` 处读取至多 `buf.len()` 字节，返回实际读到的字节数
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 内存中的文件
pub struct MemFile {
    data: SpinMutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: SpinMutex::new(data),
        }
    }

    /// 超出文件末尾时文件会被扩展
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        buf.len()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }
}
