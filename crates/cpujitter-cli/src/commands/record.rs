use std::io::{BufWriter, Write};

use cpujitter_core::Flags;

/// Dump raw deltas straight from the noise source, bypassing the health
/// tests and the conditioner, for offline SP 800-90B style assessment.
pub fn run(samples: usize, output: &str, osr: u32, blockwise: bool) {
    let mut ec = super::make_collector(osr, Flags::NONE);
    if blockwise {
        ec.use_blockwise_workload();
    }

    let deltas = match ec.raw_samples(samples) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("raw sampling failed: {e}");
            std::process::exit(1);
        }
    };

    let file = match std::fs::File::create(output) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("cannot create {output}: {e}");
            std::process::exit(1);
        }
    };
    let mut writer = BufWriter::new(file);
    for delta in &deltas {
        if writer.write_all(&delta.to_le_bytes()).is_err() {
            eprintln!("short write to {output}");
            std::process::exit(1);
        }
    }
    if writer.flush().is_err() {
        eprintln!("flush of {output} failed");
        std::process::exit(1);
    }

    println!("recorded {} raw deltas to {output}", deltas.len());
}
