//! Lazy quadtree over the domain recording which boxes a curve has visited.

use nalgebra::Vector2;

use crate::domain::{Domain, Periodicity};

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub bounds: Domain,
    pub depth: usize,
    /// A committed curve point lies in this box.
    pub visited: bool,
    children: Option<[usize; 4]>,
}

impl Region {
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct RegionPartition {
    domain: Domain,
    periodicity: Periodicity,
    max_depth: usize,
    regions: Vec<Region>,
}

impl RegionPartition {
    pub const ROOT: usize = 0;

    pub fn new(domain: Domain, periodicity: Periodicity, max_depth: usize) -> Self {
        Self {
            domain,
            periodicity,
            max_depth,
            regions: vec![Region {
                bounds: domain,
                depth: 0,
                visited: false,
                children: None,
            }],
        }
    }

    pub fn region(&self, id: usize) -> Option<&Region> {
        self.regions.get(id)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Children of `id`, created on first request. `None` at maximum depth.
    pub fn subdivide(&mut self, id: usize) -> Option<[usize; 4]> {
        let region = self.regions.get(id)?;
        if let Some(children) = region.children {
            return Some(children);
        }
        if region.depth >= self.max_depth {
            return None;
        }
        let depth = region.depth + 1;
        let quadrants = region.bounds.quadrants();
        let first = self.regions.len();
        for bounds in quadrants {
            self.regions.push(Region {
                bounds,
                depth,
                visited: false,
                children: None,
            });
        }
        let children = [first, first + 1, first + 2, first + 3];
        self.regions[id].children = Some(children);
        Some(children)
    }

    /// Containment with `uv` moved into the periodic representative first.
    pub fn in_region(&self, id: usize, uv: &Vector2<f64>) -> bool {
        let Some(region) = self.regions.get(id) else {
            return false;
        };
        let uv = self.domain.normalize(uv, self.periodicity);
        let b = &region.bounds;
        uv.x >= b.umin && uv.x <= b.umax && uv.y >= b.vmin && uv.y <= b.vmax
    }

    /// Marks every box down to the deepest level that contains `uv`.
    pub fn tick(&mut self, uv: &Vector2<f64>) {
        if !self.in_region(Self::ROOT, uv) {
            return;
        }
        let mut id = Self::ROOT;
        loop {
            self.regions[id].visited = true;
            let Some(children) = self.subdivide(id) else {
                break;
            };
            match children.iter().copied().find(|&child| self.in_region(child, uv)) {
                Some(child) => id = child,
                None => break,
            }
        }
    }

    /// Every box at maximum depth, subdividing as needed.
    pub fn leaves(&mut self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut pending = vec![Self::ROOT];
        while let Some(id) = pending.pop() {
            match self.subdivide(id) {
                Some(children) => pending.extend(children.iter().rev()),
                None => out.push(id),
            }
        }
        out
    }

    /// Deepest boxes no curve has passed through yet.
    pub fn unvisited_leaves(&mut self) -> Vec<usize> {
        self.leaves()
            .into_iter()
            .filter(|&id| !self.regions[id].visited)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdivision_is_lazy_and_bounded() {
        let mut partition = RegionPartition::new(Domain::unit(), Periodicity::default(), 2);
        assert_eq!(partition.len(), 1);
        let children = partition.subdivide(RegionPartition::ROOT).unwrap();
        assert_eq!(partition.len(), 5);
        assert_eq!(partition.subdivide(RegionPartition::ROOT), Some(children));
        assert!(partition.subdivide(children[0]).is_some());
        let grandchild = partition.subdivide(children[0]).unwrap()[0];
        assert!(partition.subdivide(grandchild).is_none());
        assert_eq!(partition.leaves().len(), 16);
    }

    #[test]
    fn tick_marks_the_path_to_the_leaf() {
        let mut partition = RegionPartition::new(Domain::unit(), Periodicity::default(), 2);
        partition.tick(&Vector2::new(0.1, 0.1));
        let unvisited = partition.unvisited_leaves();
        assert_eq!(unvisited.len(), 15);
        let visited: Vec<usize> = partition
            .leaves()
            .into_iter()
            .filter(|id| partition.region(*id).unwrap().visited)
            .collect();
        assert_eq!(visited.len(), 1);
        assert!(partition.in_region(visited[0], &Vector2::new(0.1, 0.1)));
    }

    #[test]
    fn in_region_normalizes_periodic_axes() {
        let mut partition = RegionPartition::new(Domain::unit(), Periodicity::new(true, false), 1);
        let children = partition.subdivide(RegionPartition::ROOT).unwrap();
        // quadrant (umin, vmin) holds u in [0, 0.5]
        assert!(partition.in_region(children[0], &Vector2::new(1.2, 0.1)));
        assert!(!partition.in_region(children[0], &Vector2::new(0.7, 0.1)));
        partition.tick(&Vector2::new(-0.8, 0.1));
        assert!(partition.region(children[0]).unwrap().visited);
    }

    #[test]
    fn points_outside_the_domain_are_ignored() {
        let mut partition = RegionPartition::new(Domain::unit(), Periodicity::default(), 1);
        partition.tick(&Vector2::new(2.0, 0.5));
        assert!(!partition.region(RegionPartition::ROOT).unwrap().visited);
        assert_eq!(partition.len(), 1);
    }
}
