use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();
    let arguments: Vec<String> = std::env::args().skip(1).collect();
    match gblink::run(&arguments) {
        Ok(exit_code) => ExitCode::from(exit_code as u8),
        Err(error) => {
            eprintln!("ASLINK Fatal Error: {error}");
            ExitCode::FAILURE
        }
    }
}
