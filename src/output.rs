mod channel;
mod sink;

pub use channel::OutputChannel;
pub use sink::{render_jsonl, render_pretty, OutputSink};
