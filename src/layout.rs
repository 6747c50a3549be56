//! Neuron placement on the 2D sheet.

/// Supplies the location of every neuron. Locations are fixed for a run.
pub trait NeuronLayout {
    fn len(&self) -> usize;

    fn location(&self, i: usize) -> (f32, f32);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Regular grid: neuron `i` sits at `(i mod width, i div width)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridLayout {
    pub width: u32,
    pub height: u32,
}

impl GridLayout {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl NeuronLayout for GridLayout {
    fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    fn location(&self, i: usize) -> (f32, f32) {
        let w = self.width as usize;
        ((i % w) as f32, (i / w) as f32)
    }
}

/// Explicit coordinates, one per neuron.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FixedLayout {
    points: Vec<(f32, f32)>,
}

impl FixedLayout {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }
}

impl NeuronLayout for FixedLayout {
    fn len(&self) -> usize {
        self.points.len()
    }

    fn location(&self, i: usize) -> (f32, f32) {
        self.points[i]
    }
}
