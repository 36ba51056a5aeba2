fn main() -> anyhow::Result<()> {
    drift_cli::main()
}
