mod probe;

pub use probe::SysinfoProbe;
