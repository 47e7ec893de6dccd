//! Static 2-D k-d index over a flat point array.
//!
//! Built once, never mutated. The build is an in-place Floyd-Rivest style
//! selection on alternating axes; subranges of `node_size` or fewer points
//! are left unsorted and scanned linearly by queries.

pub const DEFAULT_NODE_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct Point<T> {
    pub x: f64,
    pub y: f64,
    pub data: T,
}

pub struct KdBush<T> {
    node_size: usize,
    points: Vec<Point<T>>,
    /// Permutation back to the original point order.
    idxs: Vec<usize>,
    /// Interleaved `[x0, y0, x1, y1, ..]` in tree order.
    coords: Vec<f64>,
}

impl<T> KdBush<T> {
    pub fn new(points: Vec<Point<T>>, node_size: usize) -> Self {
        let node_size = node_size.max(1);
        let mut idxs: Vec<usize> = (0..points.len()).collect();
        let mut coords = Vec::with_capacity(points.len() * 2);
        for p in &points {
            coords.push(p.x);
            coords.push(p.y);
        }

        if points.len() > node_size {
            sort_kd(
                &mut idxs,
                &mut coords,
                node_size as isize,
                0,
                points.len() as isize - 1,
                0,
            );
        }

        Self {
            node_size,
            points,
            idxs,
            coords,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn get(&self, original_index: usize) -> &Point<T> {
        &self.points[original_index]
    }

    /// Indices (into the original input order) of all points inside the
    /// axis-aligned rectangle.
    pub fn range(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<usize> {
        let mut result = Vec::new();
        if self.points.is_empty() {
            return result;
        }

        let mut stack: Vec<(isize, isize, usize)> =
            vec![(0, self.idxs.len() as isize - 1, 0)];

        while let Some((left, right, axis)) = stack.pop() {
            if right - left <= self.node_size as isize {
                for i in left..=right {
                    let i = i as usize;
                    let x = self.coords[2 * i];
                    let y = self.coords[2 * i + 1];
                    if x >= min_x && x <= max_x && y >= min_y && y <= max_y {
                        result.push(self.idxs[i]);
                    }
                }
                continue;
            }

            let m = (left + right) / 2;
            let x = self.coords[2 * m as usize];
            let y = self.coords[2 * m as usize + 1];
            if x >= min_x && x <= max_x && y >= min_y && y <= max_y {
                result.push(self.idxs[m as usize]);
            }

            let next_axis = (axis + 1) % 2;
            if (axis == 0 && min_x <= x) || (axis != 0 && min_y <= y) {
                stack.push((left, m - 1, next_axis));
            }
            if (axis == 0 && max_x >= x) || (axis != 0 && max_y >= y) {
                stack.push((m + 1, right, next_axis));
            }
        }

        result
    }

    /// Visits every point with squared planar distance to `(qx, qy)` of at
    /// most `radius²`. The visitor returns `false` to abort the scan.
    pub fn within<F>(&self, qx: f64, qy: f64, radius: f64, mut visit: F)
    where
        F: FnMut(&Point<T>) -> bool,
    {
        if self.points.is_empty() {
            return;
        }

        let r2 = radius * radius;
        let mut stack: Vec<(isize, isize, usize)> =
            vec![(0, self.idxs.len() as isize - 1, 0)];

        while let Some((left, right, axis)) = stack.pop() {
            if right - left <= self.node_size as isize {
                for i in left..=right {
                    let i = i as usize;
                    if sq_dist(self.coords[2 * i], self.coords[2 * i + 1], qx, qy) <= r2
                        && !visit(&self.points[self.idxs[i]])
                    {
                        return;
                    }
                }
                continue;
            }

            let m = (left + right) / 2;
            let x = self.coords[2 * m as usize];
            let y = self.coords[2 * m as usize + 1];
            if sq_dist(x, y, qx, qy) <= r2 && !visit(&self.points[self.idxs[m as usize]]) {
                return;
            }

            let next_axis = (axis + 1) % 2;
            if (axis == 0 && qx - radius <= x) || (axis != 0 && qy - radius <= y) {
                stack.push((left, m - 1, next_axis));
            }
            if (axis == 0 && qx + radius >= x) || (axis != 0 && qy + radius >= y) {
                stack.push((m + 1, right, next_axis));
            }
        }
    }
}

fn sq_dist(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let dx = ax - bx;
    let dy = ay - by;
    dx * dx + dy * dy
}

fn sort_kd(
    idxs: &mut [usize],
    coords: &mut [f64],
    node_size: isize,
    left: isize,
    right: isize,
    depth: usize,
) {
    if right - left <= node_size {
        return;
    }

    let m = (left + right) / 2;
    select(idxs, coords, m, left, right, depth % 2);

    sort_kd(idxs, coords, node_size, left, m - 1, depth + 1);
    sort_kd(idxs, coords, node_size, m + 1, right, depth + 1);
}

/// Floyd-Rivest selection: partially sorts `[left, right]` so the element at
/// `k` is in its sorted position with respect to the `inc` axis.
fn select(idxs: &mut [usize], coords: &mut [f64], k: isize, left: isize, right: isize, inc: usize) {
    let mut left = left;
    let mut right = right;

    while right > left {
        if right - left > 600 {
            let n = (right - left + 1) as f64;
            let m = (k - left + 1) as f64;
            let z = n.ln();
            let s = 0.5 * (2.0 * z / 3.0).exp();
            let sd = 0.5 * (z * s * (n - s) / n).sqrt() * if m - n / 2.0 < 0.0 { -1.0 } else { 1.0 };
            let new_left = left.max((k as f64 - m * s / n + sd).floor() as isize);
            let new_right = right.min((k as f64 + (n - m) * s / n + sd).floor() as isize);
            select(idxs, coords, k, new_left, new_right, inc);
        }

        let t = coords[2 * k as usize + inc];
        let mut i = left;
        let mut j = right;

        swap_item(idxs, coords, left as usize, k as usize);
        if coords[2 * right as usize + inc] > t {
            swap_item(idxs, coords, left as usize, right as usize);
        }

        while i < j {
            swap_item(idxs, coords, i as usize, j as usize);
            i += 1;
            j -= 1;
            while coords[2 * i as usize + inc] < t {
                i += 1;
            }
            while coords[2 * j as usize + inc] > t {
                j -= 1;
            }
        }

        if coords[2 * left as usize + inc] == t {
            swap_item(idxs, coords, left as usize, j as usize);
        } else {
            j += 1;
            swap_item(idxs, coords, j as usize, right as usize);
        }

        if j <= k {
            left = j + 1;
        }
        if k <= j {
            right = j - 1;
        }
    }
}

fn swap_item(idxs: &mut [usize], coords: &mut [f64], i: usize, j: usize) {
    idxs.swap(i, j);
    coords.swap(2 * i, 2 * j);
    coords.swap(2 * i + 1, 2 * j + 1);
}
