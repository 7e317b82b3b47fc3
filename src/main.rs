fn main() {
    if let Err(e) = toolwire::run() {
        eprintln!("toolwire: {e:#}");
        std::process::exit(1);
    }
}
