use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Lowering failures. All of these are fatal: the pass is deterministic and
/// a failure indicates either a compiler bug or an invalid user schedule,
/// so nothing is retried.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A tensor is annotated for double/circular buffering but fails
    /// validation.
    #[snafu(display("invalid tensor to double-buffer: {tv}: {reason}"))]
    InvalidAnnotation { tv: String, reason: String },

    /// No axis satisfies the double-buffer axis selection rule.
    #[snafu(display("valid double buffer axis not found for {tv}: {reason}"))]
    AxisNotFound { tv: String, reason: &'static str },

    /// Two tensors mapped onto one concrete loop axis declare different
    /// pipeline depths.
    #[snafu(display(
        "unsupported multiple depth pipelining: {concrete_axis} was set to depth {existing} and then to {requested} by {axis}"
    ))]
    StageDepthConflict { concrete_axis: String, existing: u64, requested: u64, axis: String },

    /// A loop equivalence class carries two distinct non-serial parallel
    /// types.
    #[snafu(display("conflicting parallel types {first} and {second} in loop group {group}"))]
    ParallelTypeConflict { group: String, first: String, second: String },

    /// Two distinct axes of one tensor were equated under a mode that
    /// requires them distinct.
    #[snafu(display("detected self mapping on {tv}: {id_a} and {id_b} are mapped in {mode} mode"))]
    SelfMapping { tv: String, id_a: String, id_b: String, mode: String },

    /// A buffered load has no enclosing loop mapped to its buffer axis.
    #[snafu(display("no double buffer loop found for a double buffered tensor: {tv}"))]
    MissingDoubleBufferLoop { tv: String },

    /// The enclosing loop cannot host the transformation.
    #[snafu(display("unsupported loop for double buffering: {for_loop}: {reason}"))]
    UnsupportedLoopShape { for_loop: String, reason: &'static str },

    /// A lowering invariant was broken; always a compiler bug.
    #[snafu(display("internal lowering error: {message}"))]
    Internal { message: String },

    /// IR construction failure surfaced through a lowering entry point.
    #[snafu(context(false), display("{source}"))]
    Ir { source: forge_ir::Error },
}
