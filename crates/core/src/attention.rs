//! Self-attention mask construction.
//!
//! Two topologies over a fixed `max_len × max_len` grid, entry (i, j) = 1
//! meaning position i may attend to position j:
//!
//! - **filter**: row-independent column fills. Every position sees the
//!   [context, question] columns; the answer columns stay dark because the
//!   filter objective never conditions on generating the answer. With an
//!   image context the visual slots are summarized by a single visible
//!   column at the end of the fixed visual budget.
//! - **generation**: every row sees the prefix columns (context + question,
//!   bidirectional), and the answer rows additionally see earlier answer
//!   columns through a lower-triangular block — bidirectional prefix,
//!   causal suffix.

use candle_core::{Device, Result, Tensor};

pub struct AttentionMaskBuilder {
    max_len: usize,
}

impl AttentionMaskBuilder {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Filter topology, text context: columns `[0, visible_end)` lit for
    /// every row ([CLS] through the last question token).
    pub fn filter_text(&self, visible_end: usize, device: &Device) -> Result<Tensor> {
        let mut grid = vec![0u8; self.max_len * self.max_len];
        self.fill_columns(&mut grid, 0, visible_end);
        self.into_tensor(grid, device)
    }

    /// Filter topology, image context: the visual end column plus the
    /// [caption, question] columns `[meta_start, visible_end)`.
    ///
    /// `vis_end_col` is derived from the fixed visual budget (the width the
    /// visual tensors are padded to), not from the instance's region count.
    pub fn filter_image(
        &self,
        vis_end_col: usize,
        meta_start: usize,
        visible_end: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let mut grid = vec![0u8; self.max_len * self.max_len];
        self.fill_columns(&mut grid, vis_end_col, vis_end_col + 1);
        self.fill_columns(&mut grid, meta_start, visible_end);
        self.into_tensor(grid, device)
    }

    /// Generation topology: prefix columns `[0, prefix_end)` lit for every
    /// row, and a causal block over the answer span `[prefix_end, seq_len)`.
    pub fn generation(&self, prefix_end: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
        let mut grid = vec![0u8; self.max_len * self.max_len];
        self.fill_columns(&mut grid, 0, prefix_end);
        for row in prefix_end..seq_len.min(self.max_len) {
            for col in prefix_end..=row {
                grid[row * self.max_len + col] = 1;
            }
        }
        self.into_tensor(grid, device)
    }

    fn fill_columns(&self, grid: &mut [u8], start: usize, end: usize) {
        let end = end.min(self.max_len);
        for row in 0..self.max_len {
            for col in start..end {
                grid[row * self.max_len + col] = 1;
            }
        }
    }

    fn into_tensor(&self, grid: Vec<u8>, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(grid, (self.max_len, self.max_len), device)
    }
}
