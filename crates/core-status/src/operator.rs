//! Operators: the computation-graph nodes the framework declares.
//!
//! Operators are fixed for the duration of a run; only the registry mutates
//! them, and only before `start`. `prevs`/`posts` describe the DAG while the
//! declared execution order is a topological linearisation kept by the
//! registry itself.

#[derive(Debug, Clone, Default)]
pub struct Operator {
    name: String,
    tensors: Vec<String>,
    prevs: Vec<String>,
    posts: Vec<String>,
    backward_propagation: bool,
}

impl Operator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_tensor(mut self, tensor: impl Into<String>) -> Self {
        self.tensors.push(tensor.into());
        self
    }

    pub fn with_prev(mut self, op: impl Into<String>) -> Self {
        self.prevs.push(op.into());
        self
    }

    pub fn with_post(mut self, op: impl Into<String>) -> Self {
        self.posts.push(op.into());
        self
    }

    pub fn backward(mut self) -> Self {
        self.backward_propagation = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tensors this operator touches, in declaration order.
    pub fn tensors(&self) -> &[String] {
        &self.tensors
    }

    pub fn prevs(&self) -> &[String] {
        &self.prevs
    }

    pub fn posts(&self) -> &[String] {
        &self.posts
    }

    pub fn is_backward_propagation(&self) -> bool {
        self.backward_propagation
    }
}
