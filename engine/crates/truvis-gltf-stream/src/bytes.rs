use std::fmt;
use std::ops::{Deref, Range};
use std::sync::Arc;

use crate::error::{LoadError, LoadResult};

/// 引用计数的字节切片
///
/// buffer / buffer view / packed array 之间共享同一块内存，切片不发生拷贝。
#[derive(Clone)]
pub struct SharedBytes {
    data: Arc<Vec<u8>>,
    range: Range<usize>,
}
// new & init
impl SharedBytes {
    pub fn new(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data: Arc::new(data),
            range: 0..len,
        }
    }

    /// 在当前切片内再切一段，offset 相对于当前切片
    pub fn slice(&self, offset: usize, length: usize) -> LoadResult<Self> {
        let end = offset.checked_add(length).ok_or_else(|| LoadError::malformed("byte range overflows"))?;
        if end > self.len() {
            return Err(LoadError::malformed(format!(
                "byte range [{offset}, {end}) is outside of a {} byte source",
                self.len()
            )));
        }

        Ok(Self {
            data: self.data.clone(),
            range: self.range.start + offset..self.range.start + end,
        })
    }
}
// getters
impl SharedBytes {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// 两个切片是否指向同一块分配
    #[inline]
    pub fn shares_allocation_with(&self, other: &SharedBytes) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Deref for SharedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for SharedBytes {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl fmt::Debug for SharedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBytes")
            .field("range", &self.range)
            .field("allocation_len", &self.data.len())
            .finish()
    }
}
