use cpujitter_core::{Flags, selftest};

/// Estimate the common divisor of the timer's deltas, the value the startup
/// test bakes into every collector.
pub fn run(samples: usize) {
    let mut ec = super::make_collector(0, Flags::NONE);

    let deltas = match ec.raw_samples(samples) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("raw sampling failed: {e}");
            std::process::exit(1);
        }
    };

    let estimate = selftest::common_gcd(&deltas);
    println!("common divisor over {} deltas: {estimate}", deltas.len());
    println!(
        "process-wide divisor in use:   {}",
        cpujitter_core::common_timer_gcd()
    );
}
