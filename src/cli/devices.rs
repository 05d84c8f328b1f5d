use anyhow::Result;

use super::format;
use crate::devices;

pub fn handle_devices() -> Result<i32> {
    tracing::info!("looking for connected Kindle devices");
    println!("{}", format::device_list(&devices::detect()));
    Ok(0)
}
