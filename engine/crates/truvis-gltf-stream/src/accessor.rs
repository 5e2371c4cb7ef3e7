//! accessor / buffer view 的描述信息
//!
//! 与 gltf crate 的类型解耦：loader 之间只传递这些小的 Copy 结构体。

use std::fmt;

/// accessor 的分量类型，数值与 GL enum 一致
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentType {
    I8,
    U8,
    I16,
    U16,
    U32,
    F32,
}

impl ComponentType {
    #[inline]
    pub fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::U32 | Self::F32 => 4,
        }
    }

    #[inline]
    pub fn gl_enum(self) -> u32 {
        match self {
            Self::I8 => 5120,
            Self::U8 => 5121,
            Self::I16 => 5122,
            Self::U16 => 5123,
            Self::U32 => 5125,
            Self::F32 => 5126,
        }
    }

    #[inline]
    pub fn is_float(self) -> bool {
        self == Self::F32
    }
}

impl From<gltf::accessor::DataType> for ComponentType {
    fn from(value: gltf::accessor::DataType) -> Self {
        use gltf::accessor::DataType;
        match value {
            DataType::I8 => Self::I8,
            DataType::U8 => Self::U8,
            DataType::I16 => Self::I16,
            DataType::U16 => Self::U16,
            DataType::U32 => Self::U32,
            DataType::F32 => Self::F32,
        }
    }
}

/// accessor 的元素形状
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementType {
    Scalar,
    Vec2,
    Vec3,
    Vec4,
    Mat2,
    Mat3,
    Mat4,
}

impl ElementType {
    #[inline]
    pub fn component_count(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Vec2 => 2,
            Self::Vec3 => 3,
            Self::Vec4 | Self::Mat2 => 4,
            Self::Mat3 => 9,
            Self::Mat4 => 16,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scalar => "SCALAR",
            Self::Vec2 => "VEC2",
            Self::Vec3 => "VEC3",
            Self::Vec4 => "VEC4",
            Self::Mat2 => "MAT2",
            Self::Mat3 => "MAT3",
            Self::Mat4 => "MAT4",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<gltf::accessor::Dimensions> for ElementType {
    fn from(value: gltf::accessor::Dimensions) -> Self {
        use gltf::accessor::Dimensions;
        match value {
            Dimensions::Scalar => Self::Scalar,
            Dimensions::Vec2 => Self::Vec2,
            Dimensions::Vec3 => Self::Vec3,
            Dimensions::Vec4 => Self::Vec4,
            Dimensions::Mat2 => Self::Mat2,
            Dimensions::Mat3 => Self::Mat3,
            Dimensions::Mat4 => Self::Mat4,
        }
    }
}

/// 描述如何把一段字节解释成 typed 数据
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccessorDesc {
    /// 相对于 buffer view 起点的偏移
    pub byte_offset: usize,
    pub component_type: ComponentType,
    pub element_type: ElementType,
    pub count: usize,
    pub normalized: bool,
}

impl AccessorDesc {
    /// 紧密排列时单个元素的字节数
    #[inline]
    pub fn element_size(&self) -> usize {
        self.component_type.size() * self.element_type.component_count()
    }

    /// 溢出时为 None
    #[inline]
    pub fn packed_byte_length(&self) -> Option<usize> {
        self.element_size().checked_mul(self.count)
    }

    pub fn from_gltf(accessor: &gltf::Accessor<'_>) -> Self {
        Self {
            byte_offset: accessor.offset(),
            component_type: accessor.data_type().into(),
            element_type: accessor.dimensions().into(),
            count: accessor.count(),
            normalized: accessor.normalized(),
        }
    }
}

/// buffer 内的一段命名字节区间
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ViewDesc {
    pub byte_offset: usize,
    pub byte_length: usize,
    pub byte_stride: Option<usize>,
}

impl ViewDesc {
    #[inline]
    pub fn byte_end(&self) -> usize {
        self.byte_offset + self.byte_length
    }

    pub fn from_gltf(view: &gltf::buffer::View<'_>) -> Self {
        Self {
            byte_offset: view.offset(),
            byte_length: view.length(),
            byte_stride: view.stride(),
        }
    }
}
