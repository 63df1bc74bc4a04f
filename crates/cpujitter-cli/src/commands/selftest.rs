use cpujitter_core::{Flags, Timer, selftest};

/// Run the startup acceptance test against the platform clock and print the
/// report.
pub fn run(osr: u32, json: bool) {
    match selftest::run_with_timer(osr, Flags::NONE, Timer::Hardware) {
        Ok(report) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).unwrap_or_default()
                );
            } else {
                println!("startup self-test passed");
                println!("  osr:                     {}", report.osr);
                println!("  timer divisor:           {}", report.timer_gcd);
                println!("  stuck samples:           {}/1024", report.stuck_count);
                println!("  delta changes:           {}", report.delta_changes);
                println!(
                    "  2nd-derivative changes:  {}",
                    report.second_derivative_changes
                );
            }
        }
        Err(e) => {
            eprintln!("startup self-test failed: {e} (code {})", e.code());
            std::process::exit(e.code() as i32);
        }
    }
}
