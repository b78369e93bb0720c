fn main() -> Result<(), Box<dyn std::error::Error>> {
    chantier::cli::main()
}
