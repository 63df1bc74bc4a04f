pub mod gcd;
pub mod generate;
pub mod record;
pub mod selftest;

use cpujitter_core::{EntropyCollector, Flags};

/// Initialize the process-wide RNG state and allocate a collector, exiting
/// with the failure's error code if the machine is unfit.
pub fn make_collector(osr: u32, flags: Flags) -> EntropyCollector {
    if let Err(e) = cpujitter_core::init(osr, flags) {
        eprintln!("startup self-test failed: {e} (code {})", e.code());
        std::process::exit(e.code() as i32);
    }
    match EntropyCollector::alloc(osr, flags) {
        Ok(ec) => ec,
        Err(e) => {
            eprintln!("collector allocation failed: {e}");
            std::process::exit(e.code() as i32);
        }
    }
}
