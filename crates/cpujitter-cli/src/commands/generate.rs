use std::io::Write;

use cpujitter_core::Flags;

pub fn run(bytes: usize, format: &str, osr: u32, no_memory: bool, output: Option<&str>) {
    let mut flags = Flags::NONE;
    if no_memory {
        flags |= Flags::DISABLE_MEMORY_ACCESS;
    }
    let mut ec = super::make_collector(osr, flags);

    let mut data = vec![0u8; bytes];
    if let Err(e) = ec.read_safe(&mut data) {
        eprintln!("read failed: {e} (code {})", e.code());
        std::process::exit(1);
    }

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &data) {
                eprintln!("write to {path} failed: {e}");
                std::process::exit(1);
            }
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let result = match format {
                "raw" => out.write_all(&data),
                _ => {
                    let hex: String = data.iter().map(|b| format!("{b:02x}")).collect();
                    writeln!(out, "{hex}")
                }
            };
            if result.is_err() {
                // Broken pipe
                std::process::exit(1);
            }
        }
    }
}
