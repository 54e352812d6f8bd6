use ndarray::{ArrayD, ArrayViewD};

/// One ingested plane, tagged with its position in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<T> {
    sequence: u64,
    data: ArrayD<T>,
}

impl<T> Frame<T> {
    pub fn new(sequence: u64, data: ArrayD<T>) -> Self {
        Self { sequence, data }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn view(&self) -> ArrayViewD<'_, T> {
        self.data.view()
    }

    pub fn into_data(self) -> ArrayD<T> {
        self.data
    }
}
