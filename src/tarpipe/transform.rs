use crate::tarpipe::result_error::result::Result;
use std::io::{Read, Write};

/// A byte-stream codec the pipeline can drop between two stages.
///
/// `encode` and `decode` consume `input` to its end and hand `output` back once every byte,
/// trailer included, has been written to it. The pipeline never looks inside the codec.
pub trait StreamTransform {
    fn encode<R: Read + Send, W: Write + Send>(
        &self,
        input: R,
        output: W,
        buffer_size: usize,
    ) -> Result<W>;

    fn decode<R: Read + Send, W: Write + Send>(
        &self,
        input: R,
        output: W,
        buffer_size: usize,
    ) -> Result<W>;
}
