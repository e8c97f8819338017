//! Closed-loop demonstration of the zero-offset calibration against a
//! simulated first-generation front end with off-nominal transconductance
//! and trim.

use dscope::sim::SimBus;
use dscope::{Device, DSCOPE};

/// What the simulated front end actually nulls at, unknown to the device.
const TRUE_TRANS: f64 = 760.0;
const TRUE_PREOFF: f64 = 0x48 as f64;

/// Mean sample value the front end would report for the last offset drive
/// the device sent to a channel.
fn front_end_mean(bus: &SimBus, channel: usize) -> f64 {
    let tag = 0x10u64 + ((channel as u64) << 7);
    match bus.commands.iter().rev().find(|&&cmd| cmd & 0xff == tag) {
        Some(&cmd) => {
            let pwm = ((cmd >> 8) & 0xffff_ffff) as f64;
            (pwm - TRUE_PREOFF) * 255.0 / TRUE_TRANS
        }
        None => 128.0,
    }
}

fn main() -> dscope::Result<()> {
    env_logger::init();

    let mut device = Device::new(SimBus::new(&DSCOPE), &DSCOPE);
    println!("starting zero calibration of a simulated {}", DSCOPE.model);
    device.start_zero_calibration()?;

    let mut ticks = 0u32;
    while device.is_calibrating() {
        let mean = [
            front_end_mean(device.bus_mut(), 0),
            front_end_mean(device.bus_mut(), 1),
        ];
        device.bus_mut().mean = mean;
        device.tick()?;
        ticks += 1;
        assert!(ticks < 20_000, "calibration failed to converge");
    }
    println!("converged after {} ticks", ticks);

    for index in 0..2 {
        let channel = device.channel(index);
        println!("channel {}: trans {:#06x}, comb {:+.1}/{:+.1}",
                 index, channel.vpos_trans,
                 channel.comb_diff_top, channel.comb_diff_bom);
        for range in channel.ranges.iter() {
            println!("  {:>4} mV/div: vgain {:#08x}, preoff {:#06x}",
                     range.key, range.vgain, range.preoff);
        }
    }

    device.store_calibration()?;
    println!("calibration stored");
    Ok(())
}
