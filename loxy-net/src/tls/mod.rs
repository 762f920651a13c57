mod acceptor;
mod ca;
mod cert;
mod types;

pub use acceptor::build_acceptor;
pub use ca::{CaMaterial, CaMaterialPaths, generate_ca, write_ca_to_dir};
pub use cert::{LEAF_ORGANIZATION, bare_host, forge_leaf, serial_for_host};
pub use types::{CaKeyKind, CaRoot, ForgedLeaf, KeyAlgorithm, TlsError, TlsErrorKind};
