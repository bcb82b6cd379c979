use clap::Parser;

fn main() {
    let cli = mirrormonctl::Cli::parse();
    if let Err(err) = mirrormonctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
