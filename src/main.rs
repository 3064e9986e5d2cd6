use loadtest_runner::{app, logger};

fn main() {
    logger::init();
    match app::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}
