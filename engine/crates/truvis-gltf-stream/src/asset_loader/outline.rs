//! `CESIUM_primitive_outline` 的顶点数据生成
//!
//! 每个三角形的三个角分配互不相同的 axis（0 / 1 / 2），outline 坐标是一个 VEC3：
//! - 自身 axis 的分量为 1
//! - 其他分量 `k` 描述与 axis `k` 相对的那条边：是 outline 时为 0，否则为 1
//!
//! 光栅化插值之后，分量 `k` 在 outline 边上为 0，在相对的角上为 1，shader 据此画线。
//! 一个顶点被多个三角形共享时，编码必须一致；无法一致时复制该顶点。

use std::collections::HashSet;

use crate::error::{LoadError, LoadResult};

/// 三个角的 axis 的全部排列
const PERMUTATIONS: [[u8; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

/// 单个顶点的编码
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct CornerEncoding {
    axis: u8,
    /// 每个分量的值，`coordinates[axis]` 恒为 1
    coordinates: [bool; 3],
}

impl CornerEncoding {
    fn to_f32(self) -> [f32; 3] {
        self.coordinates.map(|on| if on { 1.0 } else { 0.0 })
    }
}

/// outline 生成的结果
#[derive(Debug)]
pub struct OutlineGeometry {
    /// 新的三角形 index
    pub indices: Vec<u32>,
    /// 新顶点 -> 原始顶点，用于重排所有 attribute
    pub remap: Vec<u32>,
    /// `_OUTLINE_COORDINATES`
    pub coordinates: Vec<[f32; 3]>,

    encodings: Vec<Option<CornerEncoding>>,
}

impl OutlineGeometry {
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.remap.len()
    }

    /// 被复制出来的顶点数量
    #[inline]
    pub fn duplicated_vertex_count(&self, original_vertex_count: usize) -> usize {
        self.remap.len() - original_vertex_count
    }
}

struct OutlineBuilder {
    outline_edges: HashSet<(u32, u32)>,
    /// 原始顶点 -> 它的所有副本（新顶点 index）
    copies: Vec<Vec<u32>>,
    remap: Vec<u32>,
    encodings: Vec<Option<CornerEncoding>>,
}

impl OutlineBuilder {
    fn new(vertex_count: usize, outline_indices: &[u32]) -> Self {
        let outline_edges = outline_indices
            .chunks_exact(2)
            .map(|edge| Self::edge_key(edge[0], edge[1]))
            .collect();
        Self {
            outline_edges,
            copies: (0..vertex_count as u32).map(|vertex| vec![vertex]).collect(),
            remap: (0..vertex_count as u32).collect(),
            encodings: vec![None; vertex_count],
        }
    }

    #[inline]
    fn edge_key(a: u32, b: u32) -> (u32, u32) {
        if a < b { (a, b) } else { (b, a) }
    }

    #[inline]
    fn is_outline(&self, a: u32, b: u32) -> bool {
        self.outline_edges.contains(&Self::edge_key(a, b))
    }

    /// 给定三个角的 axis，计算每个角需要的编码
    fn corner_encodings(&self, triangle: [u32; 3], axes: [u8; 3]) -> [CornerEncoding; 3] {
        std::array::from_fn(|corner| {
            let mut coordinates = [false; 3];
            coordinates[axes[corner] as usize] = true;
            for other in 0..3 {
                if other == corner {
                    continue;
                }
                // (corner, other) 这条边与第三个角相对
                let third = 3 - corner - other;
                coordinates[axes[third] as usize] = !self.is_outline(triangle[corner], triangle[other]);
            }
            CornerEncoding {
                axis: axes[corner],
                coordinates,
            }
        })
    }

    /// 已有副本中能直接复用的那个
    fn find_copy(&self, vertex: u32, encoding: CornerEncoding) -> Option<u32> {
        self.copies[vertex as usize]
            .iter()
            .copied()
            .find(|&copy| self.encodings[copy as usize].is_none_or(|existing| existing == encoding))
    }

    fn resolve(&mut self, vertex: u32, encoding: CornerEncoding) -> u32 {
        let copy = match self.find_copy(vertex, encoding) {
            Some(copy) => copy,
            None => {
                let copy = self.remap.len() as u32;
                self.remap.push(vertex);
                self.encodings.push(None);
                self.copies[vertex as usize].push(copy);
                copy
            }
        };
        self.encodings[copy as usize] = Some(encoding);
        copy
    }

    fn add_triangle(&mut self, triangle: [u32; 3], indices: &mut Vec<u32>) {
        // 选择需要复制顶点最少的排列
        let mut best = None;
        for axes in PERMUTATIONS {
            let encodings = self.corner_encodings(triangle, axes);
            let conflicts = (0..3)
                .filter(|&corner| self.find_copy(triangle[corner], encodings[corner]).is_none())
                .count();
            if best.is_none_or(|(best_conflicts, _)| conflicts < best_conflicts) {
                best = Some((conflicts, encodings));
            }
            if conflicts == 0 {
                break;
            }
        }

        let Some((_, encodings)) = best else {
            return;
        };
        for corner in 0..3 {
            let resolved = self.resolve(triangle[corner], encodings[corner]);
            indices.push(resolved);
        }
    }

    fn finish(self, indices: Vec<u32>) -> OutlineGeometry {
        let coordinates = self
            .encodings
            .iter()
            .map(|encoding| encoding.map_or([0.0; 3], CornerEncoding::to_f32))
            .collect();
        OutlineGeometry {
            indices,
            remap: self.remap,
            coordinates,
            encodings: self.encodings,
        }
    }
}

/// 为一组三角形生成 outline 坐标
///
/// `outline_indices` 是成对的顶点 index，每一对是一条需要描边的边。
pub fn generate_outlines(triangles: &[u32], vertex_count: usize, outline_indices: &[u32]) -> LoadResult<OutlineGeometry> {
    let _span = tracy_client::span!("generate_outlines");

    if triangles.len() % 3 != 0 {
        return Err(LoadError::malformed(format!(
            "{} triangle indices is not a multiple of 3",
            triangles.len()
        )));
    }
    if outline_indices.len() % 2 != 0 {
        return Err(LoadError::malformed(format!(
            "{} outline indices is not a multiple of 2",
            outline_indices.len()
        )));
    }
    if let Some(&index) = triangles.iter().chain(outline_indices).find(|&&index| index as usize >= vertex_count) {
        return Err(LoadError::malformed(format!(
            "index {index} is out of range for {vertex_count} vertices"
        )));
    }

    let mut builder = OutlineBuilder::new(vertex_count, outline_indices);
    let mut indices = Vec::with_capacity(triangles.len());
    for triangle in triangles.chunks_exact(3) {
        builder.add_triangle([triangle[0], triangle[1], triangle[2]], &mut indices);
    }

    let geometry = builder.finish(indices);
    log::debug!(
        "Generated outlines for {} triangles, {} vertices duplicated",
        triangles.len() / 3,
        geometry.duplicated_vertex_count(vertex_count)
    );
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 检查每个三角形：axis 互不相同，且每条边的编码与 outline 集合一致
    fn assert_consistent(geometry: &OutlineGeometry, outline_indices: &[u32]) {
        let outline: HashSet<(u32, u32)> = outline_indices
            .chunks_exact(2)
            .map(|edge| OutlineBuilder::edge_key(edge[0], edge[1]))
            .collect();

        for triangle in geometry.indices.chunks_exact(3) {
            let encodings: Vec<CornerEncoding> =
                triangle.iter().map(|&v| geometry.encodings[v as usize].unwrap()).collect();
            let mut axes: Vec<u8> = encodings.iter().map(|encoding| encoding.axis).collect();
            axes.sort();
            assert_eq!(axes, vec![0, 1, 2]);

            for corner in 0..3 {
                for other in (corner + 1)..3 {
                    let third = 3 - corner - other;
                    let axis = encodings[third].axis as usize;
                    let a = geometry.remap[triangle[corner] as usize];
                    let b = geometry.remap[triangle[other] as usize];
                    let expected_visible = outline.contains(&OutlineBuilder::edge_key(a, b));
                    assert_eq!(encodings[corner].coordinates[axis], !expected_visible);
                    assert_eq!(encodings[other].coordinates[axis], !expected_visible);
                }
            }
        }
    }

    #[test]
    fn test_single_triangle() {
        let outline = [0, 1, 1, 2, 2, 0];
        let geometry = generate_outlines(&[0, 1, 2], 3, &outline).unwrap();

        assert_eq!(geometry.indices, vec![0, 1, 2]);
        assert_eq!(geometry.remap, vec![0, 1, 2]);
        assert_eq!(
            geometry.coordinates,
            vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
        );
        assert_consistent(&geometry, &outline);
    }

    #[test]
    fn test_quad_without_diagonal_shares_vertices() {
        // 0 - 1
        // | / |
        // 2 - 3
        let triangles = [0, 2, 1, 1, 2, 3];
        let outline = [0, 1, 1, 3, 3, 2, 2, 0];
        let geometry = generate_outlines(&triangles, 4, &outline).unwrap();

        assert_eq!(geometry.vertex_count(), 4);
        assert_consistent(&geometry, &outline);
    }

    #[test]
    fn test_closed_fan_duplicates_vertices() {
        // 中心顶点 3 周围的三个三角形，外圈的环长度为奇数，无法只用两个 axis 交替
        let triangles = [3, 0, 1, 3, 1, 2, 3, 2, 0];
        let outline = [0, 1, 1, 2, 2, 0];
        let geometry = generate_outlines(&triangles, 4, &outline).unwrap();

        assert!(geometry.duplicated_vertex_count(4) > 0);
        assert_eq!(geometry.indices.len(), triangles.len());
        assert_eq!(geometry.coordinates.len(), geometry.remap.len());
        assert_consistent(&geometry, &outline);
    }

    #[test]
    fn test_out_of_range_index() {
        let err = generate_outlines(&[0, 1, 5], 3, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::LoadErrorKind::MalformedAsset);
    }
}
