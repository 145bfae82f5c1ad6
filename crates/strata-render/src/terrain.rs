// SPDX-License-Identifier: CEPL-1.0
//! Terrain geometry: heightmap tiles to vertex/index streams.
//!
//! Every tile owns twelve vertices: the four corners (NW, NE, SW, SE) written
//! three times. The first copy belongs to the top face, the second to the
//! west-wall faces and the third to the north-wall faces. Walls and tops meet
//! at the same positions but need their own normals, so they never share a
//! vertex.
//!
//! Indices are grouped five per face (four vertex indices for a triangle strip
//! plus [`RESTART_INDEX`]); a face that is not drawn is five restart indices.

use anyhow::{ensure, Result};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use strata_math::{face_normal, Vec3};

use crate::RenderError;

/// Primitive-restart sentinel for 32-bit index buffers.
pub const RESTART_INDEX: u32 = u32::MAX;
pub const VERTICES_PER_TILE: usize = 12;
pub const GROUP_LEN: usize = 5;
pub const INDICES_PER_TILE: usize = 3 * GROUP_LEN;
pub const GRID_INDICES_PER_TILE: usize = 6;

pub const TILE_SIZE: f32 = 1.0;
/// World height of one elevation step.
pub const HEIGHT_STEP: f32 = 0.5;

const TOP: usize = 0;
const WEST: usize = 4;
const NORTH: usize = 8;

const NW: usize = 0;
const NE: usize = 1;
const SW: usize = 2;
const SE: usize = 3;

const SENTINEL_GROUP: [u32; GROUP_LEN] = [RESTART_INDEX; GROUP_LEN];

/// Elevations at the four corners of one tile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileCorners {
    pub nw: i8,
    pub ne: i8,
    pub sw: i8,
    pub se: i8,
}

impl TileCorners {
    pub const fn new(nw: i8, ne: i8, sw: i8, se: i8) -> Self {
        Self { nw, ne, sw, se }
    }

    pub const fn flat(h: i8) -> Self {
        Self::new(h, h, h, h)
    }

    fn as_array(self) -> [i8; 4] {
        [self.nw, self.ne, self.sw, self.se]
    }

    /// Whether the top face is split along the NW–SE diagonal.
    ///
    /// The rule keeps the fold direction consistent across sloped terrain:
    /// the diagonal whose lower end still sits below the highest opposite
    /// corner wins, and symmetric tiles always fold NW–SE.
    pub fn splits_nw_se(self) -> bool {
        let other = self.ne.max(self.sw);
        (self.nw <= self.se && self.se < other)
            || (self.se <= self.nw && self.nw < other)
            || (self.nw == self.se && self.ne == self.sw)
    }
}

/// Read-only view of the world's height data.
pub trait TerrainSource {
    /// Size in tiles, `(width, height)`.
    fn size(&self) -> (u32, u32);
    fn corners(&self, x: u32, y: u32) -> TileCorners;
}

/// Row-major grid of tiles with independent corner elevations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Heightmap {
    width: u32,
    height: u32,
    tiles: Vec<TileCorners>,
}

impl Heightmap {
    pub fn new(width: u32, height: u32, tiles: Vec<TileCorners>) -> Result<Self> {
        ensure!(
            tiles.len() == width as usize * height as usize,
            "heightmap {}x{} needs {} tiles, got {}",
            width,
            height,
            width as usize * height as usize,
            tiles.len()
        );
        Ok(Self {
            width,
            height,
            tiles,
        })
    }

    pub fn flat(width: u32, height: u32, elevation: i8) -> Self {
        Self::from_fn(width, height, |_, _| TileCorners::flat(elevation))
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> TileCorners) -> Self {
        let mut tiles = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                tiles.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            tiles,
        }
    }

    /// Builds a seamless map from `(width + 1) × (height + 1)` shared corner
    /// elevations, row-major.
    pub fn from_corner_grid(width: u32, height: u32, corners: &[i8]) -> Result<Self> {
        let stride = width as usize + 1;
        ensure!(
            corners.len() == stride * (height as usize + 1),
            "corner grid for {}x{} tiles needs {} samples, got {}",
            width,
            height,
            stride * (height as usize + 1),
            corners.len()
        );
        Ok(Self::from_fn(width, height, |x, y| {
            let (x, y) = (x as usize, y as usize);
            TileCorners::new(
                corners[y * stride + x],
                corners[y * stride + x + 1],
                corners[(y + 1) * stride + x],
                corners[(y + 1) * stride + x + 1],
            )
        }))
    }

    pub fn set(&mut self, x: u32, y: u32, corners: TileCorners) {
        let i = self.index(x, y);
        self.tiles[i] = corners;
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

impl TerrainSource for Heightmap {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn corners(&self, x: u32, y: u32) -> TileCorners {
        self.tiles[self.index(x, y)]
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TileVertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub normal: [f32; 3],
}

bitflags! {
    /// Wall faces a tile actually draws.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WallFaces: u8 {
        const WEST = 0b01;
        const NORTH = 0b10;
    }
}

/// CPU-side terrain geometry, ready for upload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TerrainMesh {
    width: u32,
    height: u32,
    pub vertices: Vec<TileVertex>,
    pub surface_indices: Vec<u32>,
    pub grid_indices: Vec<u32>,
}

impl TerrainMesh {
    pub fn build<S: TerrainSource + ?Sized>(source: &S) -> Result<Self> {
        let (width, height) = source.size();
        let tiles = width as u64 * height as u64;
        // Every vertex index must stay below the restart index.
        tiles
            .checked_mul(VERTICES_PER_TILE as u64)
            .filter(|&n| n < RESTART_INDEX as u64)
            .ok_or(RenderError::TerrainTooLarge { tiles })?;
        let tiles = tiles as usize;

        let mut mesh = Self {
            width,
            height,
            vertices: vec![TileVertex::default(); tiles * VERTICES_PER_TILE],
            surface_indices: Vec::with_capacity(tiles * INDICES_PER_TILE),
            grid_indices: Vec::with_capacity(tiles * GRID_INDICES_PER_TILE),
        };

        for y in 0..height {
            for x in 0..width {
                let corners = source.corners(x, y);
                mesh.write_tile_vertices(x, y, corners);

                let top = mesh.top_face(x, y, corners);
                mesh.surface_indices.extend_from_slice(&top);

                let west = if x > 0 {
                    mesh.west_wall(x, y, corners, source.corners(x - 1, y))
                } else {
                    SENTINEL_GROUP
                };
                mesh.surface_indices.extend_from_slice(&west);

                let north = if y > 0 {
                    mesh.north_wall(x, y, corners, source.corners(x, y - 1))
                } else {
                    SENTINEL_GROUP
                };
                mesh.surface_indices.extend_from_slice(&north);

                let b = mesh.vertex_base(x, y);
                mesh.grid_indices.extend_from_slice(&[
                    b + NW as u32,
                    b + NE as u32,
                    b + SE as u32,
                    b + SW as u32,
                    b + NW as u32,
                    RESTART_INDEX,
                ]);
            }
        }
        Ok(mesh)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex_base(&self, x: u32, y: u32) -> u32 {
        (y * self.width + x) * VERTICES_PER_TILE as u32
    }

    pub fn top_group(&self, x: u32, y: u32) -> &[u32] {
        self.group(x, y, 0)
    }

    pub fn west_group(&self, x: u32, y: u32) -> &[u32] {
        self.group(x, y, 1)
    }

    pub fn north_group(&self, x: u32, y: u32) -> &[u32] {
        self.group(x, y, 2)
    }

    pub fn walls(&self, x: u32, y: u32) -> WallFaces {
        let mut walls = WallFaces::empty();
        walls.set(WallFaces::WEST, self.west_group(x, y)[0] != RESTART_INDEX);
        walls.set(WallFaces::NORTH, self.north_group(x, y)[0] != RESTART_INDEX);
        walls
    }

    fn group(&self, x: u32, y: u32, face: usize) -> &[u32] {
        let tile = (y * self.width + x) as usize;
        let start = tile * INDICES_PER_TILE + face * GROUP_LEN;
        &self.surface_indices[start..start + GROUP_LEN]
    }

    fn write_tile_vertices(&mut self, x: u32, y: u32, corners: TileCorners) {
        let base = self.vertex_base(x, y) as usize;
        let heights = corners.as_array();
        let offsets = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)];
        for (corner, (&h, (dx, dz))) in heights.iter().zip(offsets).enumerate() {
            let position = [
                (x as f32 + dx) * TILE_SIZE,
                h as f32 * HEIGHT_STEP,
                (y as f32 + dz) * TILE_SIZE,
            ];
            for (copy, color) in [(TOP, top_color(h)), (WEST, wall_color(h)), (NORTH, wall_color(h))] {
                self.vertices[base + copy + corner] = TileVertex {
                    position,
                    color,
                    normal: Vec3::Y.to_array(),
                };
            }
        }
    }

    fn top_face(&mut self, x: u32, y: u32, corners: TileCorners) -> [u32; GROUP_LEN] {
        let base = self.vertex_base(x, y) as usize;
        let strip = if corners.splits_nw_se() {
            [NE, NW, SE, SW]
        } else {
            [NW, SW, NE, SE]
        };
        let v = strip.map(|c| base + TOP + c);
        let p = v.map(|i| Vec3::from(self.vertices[i].position));

        // strip triangles: (v0, v1, v2) and (v1, v3, v2)
        let n0 = face_normal(p[0], p[1], p[2]);
        let n1 = face_normal(p[1], p[3], p[2]);
        let shared = (n0 + n1).try_normalize().unwrap_or(n0);
        self.set_normal(v[0], n0);
        self.set_normal(v[1], shared);
        self.set_normal(v[2], shared);
        self.set_normal(v[3], n1);

        let v = v.map(|i| i as u32);
        [v[0], v[1], v[2], v[3], RESTART_INDEX]
    }

    /// Wall on the west edge of `(x, y)`, against the east edge of `(x - 1, y)`.
    fn west_wall(&mut self, x: u32, y: u32, own: TileCorners, prev: TileCorners) -> [u32; GROUP_LEN] {
        let base = self.vertex_base(x, y) as usize + WEST;
        let pbase = self.vertex_base(x - 1, y) as usize + WEST;
        self.wall(
            [pbase + NE, base + NW, pbase + SE, base + SW],
            [(own.nw, prev.ne), (own.sw, prev.se)],
            Vec3::NEG_X,
        )
    }

    /// Wall on the north edge of `(x, y)`, against the south edge of `(x, y - 1)`.
    fn north_wall(&mut self, x: u32, y: u32, own: TileCorners, prev: TileCorners) -> [u32; GROUP_LEN] {
        let base = self.vertex_base(x, y) as usize + NORTH;
        let pbase = self.vertex_base(x, y - 1) as usize + NORTH;
        self.wall(
            [pbase + SW, base + NW, pbase + SE, base + NE],
            [(own.nw, prev.sw), (own.ne, prev.se)],
            Vec3::NEG_Z,
        )
    }

    /// `strip` is `[prev_a, own_a, prev_b, own_b]` where `a`/`b` are the two
    /// ends of the shared edge and `ends` holds `(own, prev)` elevations for
    /// each end. `toward_prev` points from this tile toward the neighbour.
    fn wall(&mut self, strip: [usize; 4], ends: [(i8, i8); 2], toward_prev: Vec3) -> [u32; GROUP_LEN] {
        if ends.iter().all(|(own, prev)| own == prev) {
            return SENTINEL_GROUP;
        }
        let p = strip.map(|i| Vec3::from(self.vertices[i].position));
        let mut n0 = face_normal(p[0], p[1], p[2]);
        let mut n1 = face_normal(p[1], p[3], p[2]);

        // A wall faces the lower side of its end.
        for (n, &(own, prev)) in [&mut n0, &mut n1].into_iter().zip(ends.iter()) {
            let expected = match own.cmp(&prev) {
                std::cmp::Ordering::Greater => toward_prev,
                std::cmp::Ordering::Less => -toward_prev,
                std::cmp::Ordering::Equal => continue,
            };
            if n.dot(expected) < 0.0 {
                *n = -*n;
            }
        }
        if n0.is_nan() {
            n0 = n1;
        } else if n1.is_nan() {
            n1 = n0;
        }

        self.set_normal(strip[0], n0);
        self.set_normal(strip[1], n0);
        self.set_normal(strip[2], n1);
        self.set_normal(strip[3], n1);

        let v = strip.map(|i| i as u32);
        [v[0], v[1], v[2], v[3], RESTART_INDEX]
    }

    fn set_normal(&mut self, vertex: usize, n: Vec3) {
        self.vertices[vertex].normal = n.to_array();
    }
}

fn top_color(h: i8) -> [f32; 3] {
    match h {
        h if h < 0 => [0.12, 0.30, 0.62],
        0 => [0.76, 0.70, 0.50],
        h => {
            let t = (h.min(24) as f32) / 24.0;
            [0.22 + 0.25 * t, 0.55 - 0.15 * t, 0.16 + 0.10 * t]
        }
    }
}

fn wall_color(h: i8) -> [f32; 3] {
    if h < 0 {
        [0.10, 0.18, 0.30]
    } else {
        [0.42, 0.33, 0.24]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal(mesh: &TerrainMesh, i: u32) -> Vec3 {
        Vec3::from(mesh.vertices[i as usize].normal)
    }

    #[test]
    fn single_flat_tile() {
        let mesh = TerrainMesh::build(&Heightmap::flat(1, 1, 0)).unwrap();
        assert_eq!(mesh.vertices.len(), 12);
        assert_eq!(mesh.surface_indices.len(), 15);
        assert_eq!(mesh.top_group(0, 0), &[1, 0, 3, 2, RESTART_INDEX]);
        assert_eq!(mesh.west_group(0, 0), &SENTINEL_GROUP);
        assert_eq!(mesh.north_group(0, 0), &SENTINEL_GROUP);
        assert_eq!(mesh.walls(0, 0), WallFaces::empty());
        for v in &mesh.vertices[..4] {
            assert_eq!(v.normal, [0.0, 1.0, 0.0]);
        }
    }

    #[test]
    fn buffer_sizes_follow_tile_count() {
        let map = Heightmap::from_fn(5, 3, |x, y| TileCorners::flat((x + y) as i8));
        let mesh = TerrainMesh::build(&map).unwrap();
        assert_eq!(mesh.vertices.len(), 5 * 3 * VERTICES_PER_TILE);
        assert_eq!(mesh.surface_indices.len(), 5 * 3 * INDICES_PER_TILE);
        assert_eq!(mesh.grid_indices.len(), 5 * 3 * GRID_INDICES_PER_TILE);

        for y in 0..3 {
            for x in 0..5 {
                let top = mesh.top_group(x, y);
                assert!(top[..4].iter().all(|&i| i != RESTART_INDEX));
                assert_eq!(top[4], RESTART_INDEX);

                let walls = mesh.walls(x, y);
                assert_eq!(walls.contains(WallFaces::WEST), x > 0);
                assert_eq!(walls.contains(WallFaces::NORTH), y > 0);
            }
        }
    }

    #[test]
    fn diagonal_choice() {
        // low NW–SE diagonal under a higher corner: NW–SE
        assert!(TileCorners::new(0, 2, 1, 0).splits_nw_se());
        // two equal diagonal pairs: NW–SE
        assert!(TileCorners::new(2, 0, 0, 2).splits_nw_se());
        // single raised SE corner: NE–SW
        assert!(!TileCorners::new(0, 0, 0, 1).splits_nw_se());

        let map = Heightmap::new(1, 1, vec![TileCorners::new(0, 0, 0, 1)]).unwrap();
        let mesh = TerrainMesh::build(&map).unwrap();
        assert_eq!(mesh.top_group(0, 0), &[0, 2, 1, 3, RESTART_INDEX]);
    }

    #[test]
    fn top_normals_point_up() {
        let corners: Vec<i8> = (0..25).map(|i| ((i * 7) % 5) as i8 - 2).collect();
        let map = Heightmap::from_corner_grid(4, 4, &corners).unwrap();
        let mesh = TerrainMesh::build(&map).unwrap();
        for y in 0..4 {
            for x in 0..4 {
                for &i in &mesh.top_group(x, y)[..4] {
                    let n = normal(&mesh, i);
                    assert!(n.is_finite());
                    assert!(n.y > 0.0, "tile ({x},{y}) vertex {i} normal {n}");
                }
            }
        }
    }

    #[test]
    fn flat_neighbours_have_no_walls() {
        let mesh = TerrainMesh::build(&Heightmap::flat(3, 3, 4)).unwrap();
        for y in 0..3 {
            for x in 0..3 {
                assert_eq!(mesh.walls(x, y), WallFaces::empty());
            }
        }
    }

    #[test]
    fn walls_face_the_lower_side() {
        // a staircase rising eastwards: each west wall faces west (-X)
        let map = Heightmap::from_fn(3, 1, |x, _| TileCorners::flat(x as i8 * 2));
        let mesh = TerrainMesh::build(&map).unwrap();
        for x in 1..3 {
            for &i in &mesh.west_group(x, 0)[..4] {
                assert!((normal(&mesh, i) - Vec3::NEG_X).length() < 1e-5);
            }
        }

        // a staircase descending southwards: each north wall faces south (+Z)
        let map = Heightmap::from_fn(1, 3, |_, y| TileCorners::flat(-(y as i8)));
        let mesh = TerrainMesh::build(&map).unwrap();
        for y in 1..3 {
            for &i in &mesh.north_group(0, y)[..4] {
                assert!((normal(&mesh, i) - Vec3::Z).length() < 1e-5);
            }
        }
    }

    #[test]
    fn degenerate_wall_triangle_borrows_neighbour_normal() {
        // north ends meet at the same elevation, south ends differ
        let map = Heightmap::new(
            2,
            1,
            vec![TileCorners::flat(0), TileCorners::new(0, 0, 2, 2)],
        )
        .unwrap();
        let mesh = TerrainMesh::build(&map).unwrap();
        assert!(mesh.walls(1, 0).contains(WallFaces::WEST));
        for &i in &mesh.west_group(1, 0)[..4] {
            let n = normal(&mesh, i);
            assert!(!n.is_nan());
            assert!((n - Vec3::NEG_X).length() < 1e-5);
        }
    }

    #[test]
    fn degenerate_south_wall_triangle_borrows_north_normal() {
        // south ends meet at the same elevation, north ends differ
        let map = Heightmap::new(
            2,
            1,
            vec![TileCorners::flat(0), TileCorners::new(2, 2, 0, 0)],
        )
        .unwrap();
        let mesh = TerrainMesh::build(&map).unwrap();
        assert!(mesh.walls(1, 0).contains(WallFaces::WEST));
        for &i in &mesh.west_group(1, 0)[..4] {
            let n = normal(&mesh, i);
            assert!(n.is_finite(), "vertex {i}: {n}");
            assert!((n - Vec3::NEG_X).length() < 1e-5);
        }
    }

    #[test]
    fn walls_use_their_own_vertex_copies() {
        let map = Heightmap::from_fn(2, 2, |x, y| TileCorners::flat((x * 3 + y) as i8));
        let mesh = TerrainMesh::build(&map).unwrap();
        let mut seen = std::collections::HashSet::new();
        for y in 0..2 {
            for x in 0..2 {
                for group in [mesh.top_group(x, y), mesh.west_group(x, y), mesh.north_group(x, y)] {
                    for &i in group.iter().filter(|&&i| i != RESTART_INDEX) {
                        assert!(seen.insert(i), "vertex {i} used by two faces");
                    }
                }
            }
        }
    }

    #[test]
    fn grid_outlines_each_top_face() {
        let mesh = TerrainMesh::build(&Heightmap::flat(2, 1, 0)).unwrap();
        assert_eq!(
            &mesh.grid_indices[6..12],
            &[12, 13, 15, 14, 12, RESTART_INDEX]
        );
    }

    #[test]
    fn empty_terrain_builds_nothing() {
        let mesh = TerrainMesh::build(&Heightmap::flat(0, 7, 0)).unwrap();
        assert!(mesh.is_empty());
        assert!(mesh.surface_indices.is_empty());
    }

    #[test]
    fn oversized_terrain_is_rejected() {
        struct Dims(u32, u32);
        impl TerrainSource for Dims {
            fn size(&self) -> (u32, u32) {
                (self.0, self.1)
            }
            fn corners(&self, _: u32, _: u32) -> TileCorners {
                TileCorners::default()
            }
        }
        for (w, h) in [(u32::MAX, 2), (u32::MAX, u32::MAX), (65_536, 65_536)] {
            let err = TerrainMesh::build(&Dims(w, h)).unwrap_err();
            assert!(
                matches!(
                    err.downcast_ref::<RenderError>(),
                    Some(RenderError::TerrainTooLarge { .. })
                ),
                "{w}x{h}: {err}"
            );
        }
    }

    #[test]
    fn corner_grid_shares_edges() {
        let map = Heightmap::from_corner_grid(2, 1, &[0, 1, 2, 3, 4, 5]).unwrap();
        assert_eq!(map.corners(0, 0), TileCorners::new(0, 1, 3, 4));
        assert_eq!(map.corners(1, 0), TileCorners::new(1, 2, 4, 5));
        assert!(Heightmap::from_corner_grid(2, 1, &[0; 5]).is_err());
    }
}
