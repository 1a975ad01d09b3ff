use clap::Parser;

fn main() {
    let cli = globecastctl::Cli::parse();
    if let Err(err) = globecastctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
