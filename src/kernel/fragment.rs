//! Typed fragments of kernel output.

/// One piece of the kernel's reply stream for a single submission,
/// delivered in kernel emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Stdout(String),
    Stderr(String),
    Image {
        media_type: String,
        data: Vec<u8>,
    },
    /// The kernel raised while executing the submission. More fragments
    /// may still follow if the kernel keeps running.
    Error {
        name: String,
        message: String,
        traceback: Vec<String>,
    },
    /// Completion marker; always the last fragment of a submission.
    Done,
}
