//! accessor 数据的紧密打包
//!
//! GPU buffer 上传和按字节重新解释都要求数据紧密排列：
//! - stride 等于元素大小时，直接返回 source 的零拷贝视图
//! - 否则按分量逐个读取，写入新分配的紧密数组

use std::borrow::Cow;

use crate::accessor::{AccessorDesc, ComponentType, ElementType};
use crate::bytes::SharedBytes;
use crate::error::{LoadError, LoadResult};

#[derive(Clone, Debug)]
enum PackedStorage {
    /// 与 buffer view 共享内存
    View(SharedBytes),
    /// 从带 stride 的数据中重新打包出来的
    Owned(Vec<u8>),
}

/// 紧密排列的 typed 数组
#[derive(Clone, Debug)]
pub struct PackedArray {
    component_type: ComponentType,
    element_type: ElementType,
    count: usize,
    storage: PackedStorage,
}
// new & init
impl PackedArray {
    pub fn from_vec(component_type: ComponentType, element_type: ElementType, bytes: Vec<u8>) -> Self {
        let element_size = component_type.size() * element_type.component_count();
        debug_assert_eq!(bytes.len() % element_size, 0);
        Self {
            component_type,
            element_type,
            count: bytes.len() / element_size,
            storage: PackedStorage::Owned(bytes),
        }
    }

    pub fn from_slice<T: bytemuck::Pod>(component_type: ComponentType, element_type: ElementType, data: &[T]) -> Self {
        debug_assert_eq!(size_of::<T>(), component_type.size());
        Self::from_vec(component_type, element_type, bytemuck::cast_slice(data).to_vec())
    }
}
// getters
impl PackedArray {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            PackedStorage::View(bytes) => bytes.as_slice(),
            PackedStorage::Owned(bytes) => bytes,
        }
    }

    /// 是否是 source 的零拷贝视图
    #[inline]
    pub fn is_view(&self) -> bool {
        matches!(self.storage, PackedStorage::View(_))
    }

    #[inline]
    pub fn shares_memory_with(&self, source: &SharedBytes) -> bool {
        matches!(&self.storage, PackedStorage::View(bytes) if bytes.shares_allocation_with(source))
    }

    #[inline]
    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    #[inline]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// 元素个数
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.component_type.size() * self.element_type.component_count()
    }

    #[inline]
    pub fn byte_length(&self) -> usize {
        self.as_bytes().len()
    }
}
// tools
impl PackedArray {
    /// 以 `T` 读取全部分量
    ///
    /// 对齐时直接借用；没有对齐（例如 accessor byteOffset 不是分量大小的整数倍）时，
    /// 拷贝到对齐的 Vec 中并输出 warning。
    pub fn typed<T: bytemuck::Pod>(&self) -> Cow<'_, [T]> {
        assert_eq!(
            size_of::<T>(),
            self.component_type.size(),
            "typed read does not match the {:?} component type",
            self.component_type
        );

        let bytes = self.as_bytes();
        match bytemuck::try_cast_slice::<u8, T>(bytes) {
            Ok(slice) => Cow::Borrowed(slice),
            Err(_) => {
                log::warn!(
                    "{}",
                    LoadError::UnalignedData(format!(
                        "{} byte {:?} array is not aligned to its element size, copying",
                        bytes.len(),
                        self.component_type
                    ))
                );
                Cow::Owned(bytemuck::pod_collect_to_vec::<u8, T>(bytes))
            }
        }
    }

    /// 把任意整数类型的 scalar 数组读成 u32，用于 index 数据
    pub fn read_indices(&self) -> LoadResult<Vec<u32>> {
        if self.element_type != ElementType::Scalar {
            return Err(LoadError::malformed(format!(
                "index data must be SCALAR, got {}",
                self.element_type
            )));
        }

        let indices = match self.component_type {
            ComponentType::U8 => self.as_bytes().iter().map(|&v| v as u32).collect(),
            ComponentType::U16 => self.typed::<u16>().iter().map(|&v| v as u32).collect(),
            ComponentType::U32 => self.typed::<u32>().into_owned(),
            other => {
                return Err(LoadError::malformed(format!("{other:?} is not a valid index component type")));
            }
        };
        Ok(indices)
    }

    /// 按 remap 表重新排列元素：`result[i] = self[remap[i]]`
    pub fn remap(&self, remap: &[u32]) -> LoadResult<PackedArray> {
        let element_size = self.element_size();
        let bytes = self.as_bytes();
        let mut out = Vec::with_capacity(remap.len() * element_size);
        for &source in remap {
            let start = source as usize * element_size;
            let element = bytes.get(start..start + element_size).ok_or_else(|| {
                LoadError::malformed(format!("vertex {source} is outside of a {} element attribute", self.count))
            })?;
            out.extend_from_slice(element);
        }
        Ok(Self::from_vec(self.component_type, self.element_type, out))
    }
}

/// 把 accessor 描述的数据打包成紧密数组
///
/// `view` 是整个 buffer view 的字节，`byte_stride` 是 view 上声明的 stride。
pub fn pack_accessor(view: &SharedBytes, accessor: &AccessorDesc, byte_stride: Option<usize>) -> LoadResult<PackedArray> {
    let element_size = accessor.element_size();
    let stride = byte_stride.unwrap_or(element_size);
    if stride < element_size {
        return Err(LoadError::malformed(format!(
            "byteStride {stride} is smaller than the {element_size} byte {} element",
            accessor.element_type
        )));
    }

    if accessor.count == 0 {
        return Ok(PackedArray::from_vec(accessor.component_type, accessor.element_type, Vec::new()));
    }

    let overflow = || LoadError::malformed(format!("accessor with {} elements overflows usize", accessor.count));
    let required = stride
        .checked_mul(accessor.count - 1)
        .and_then(|span| span.checked_add(element_size))
        .and_then(|span| span.checked_add(accessor.byte_offset))
        .ok_or_else(overflow)?;
    let packed_byte_length = accessor.packed_byte_length().ok_or_else(overflow)?;
    if required > view.len() {
        return Err(LoadError::malformed(format!(
            "accessor needs {required} bytes but its buffer view only has {}",
            view.len()
        )));
    }

    if stride == element_size {
        let bytes = view.slice(accessor.byte_offset, packed_byte_length)?;
        return Ok(PackedArray {
            component_type: accessor.component_type,
            element_type: accessor.element_type,
            count: accessor.count,
            storage: PackedStorage::View(bytes),
        });
    }

    let reader = StridedReader {
        source: view.as_slice(),
        base: accessor.byte_offset,
        stride,
        component_size: accessor.component_type.size(),
    };
    let component_count = accessor.element_type.component_count();
    let mut packed = Vec::with_capacity(packed_byte_length);
    for element in 0..accessor.count {
        for component in 0..component_count {
            packed.extend_from_slice(reader.component(element, component));
        }
    }

    Ok(PackedArray {
        component_type: accessor.component_type,
        element_type: accessor.element_type,
        count: accessor.count,
        storage: PackedStorage::Owned(packed),
    })
}

/// 按 stride 读取单个分量的原始字节
struct StridedReader<'a> {
    source: &'a [u8],
    base: usize,
    stride: usize,
    component_size: usize,
}

impl StridedReader<'_> {
    #[inline]
    fn component(&self, element: usize, component: usize) -> &[u8] {
        let offset = self.base + element * self.stride + component * self.component_size;
        &self.source[offset..offset + self.component_size]
    }
}
