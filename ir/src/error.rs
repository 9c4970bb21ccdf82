use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Producer and consumer root domains cannot be aligned.
    #[snafu(display(
        "root rank mismatch: producer {producer} has {producer_rank} root axes, consumer {consumer} has {consumer_rank}"
    ))]
    RootRankMismatch { producer: String, consumer: String, producer_rank: usize, consumer_rank: usize },

    /// Permutation is not a bijection over the input root axes.
    #[snafu(display("invalid permutation {order:?}: expected a permutation of 0..{rank}"))]
    InvalidPermutation { order: Vec<usize>, rank: usize },

    /// A tensor already has a defining op.
    #[snafu(display("tensor {tv} already has a definition"))]
    OutputRedefined { tv: String },

    /// Replay input count does not match the original transform.
    #[snafu(display("replay arity mismatch: transform takes {expected} inputs, got {found}"))]
    ReplayArityMismatch { expected: usize, found: usize },
}
