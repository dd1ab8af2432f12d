mod dguta;

pub use dguta::{DgutaReader, DgutaWriter};
