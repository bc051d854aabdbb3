/*
    Bandwidth optimization.

    There are two ways the bandwidth gets tuned. The online optimizers learn from
    every single piece of feedback: each estimation schedules the gradient of the
    estimate with respect to the bandwidth, and once the true selectivity is
    known the gradient of the error follows from the chain rule. The gradients of
    a mini-batch of observations are accumulated on the device before an update
    is applied to the bandwidth.

    The batch optimizer runs out of band. It looks at the recorded feedback of a
    table and searches for the bandwidth minimizing the mean error over all of
    it. It also computes the rule-of-thumb bandwidth every model starts with.

    Both share the per point gradient computation in `gradient`.
*/
pub mod batch;
pub mod gradient;
pub mod online;
pub mod rmsprop;
pub mod vsgd;

pub use online::OnlineOptimizer;

/// Plain bandwidths never go below this.
pub const MIN_BANDWIDTH: f64 = 1e-10;
