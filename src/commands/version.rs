pub fn run() -> anyhow::Result<()> {
    println!("kube-nodeqos {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
