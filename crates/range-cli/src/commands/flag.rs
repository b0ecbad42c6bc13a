use anyhow::{Result, bail};
use lab_orchestration::Flag;

pub fn run(count: usize, masked: bool) -> Result<()> {
    if count == 0 {
        bail!("Flag count must be at least 1");
    }

    for _ in 0..count {
        let flag = Flag::generate();
        if masked {
            println!("{}  {}", flag, flag.masked());
        } else {
            println!("{}", flag);
        }
    }
    Ok(())
}
