use rsmi::api::Frequencies;
use rsmi::device::attribute::ClockType;
use rsmi::device::monitor::{TempMetric, TempSensor};
use rsmi::{Config, InitFlags, RocmSmi, RsmiResult, topology};

fn print_clocks(name: &str, freqs: &Frequencies) {
    println!("    {name}:");
    for (i, f) in freqs.levels().iter().enumerate() {
        let marker = if i as u32 == freqs.current { " *" } else { "" };
        println!("      {i}: {} MHz{marker}", f / 1_000_000);
    }
}

fn main() -> RsmiResult<()> {
    println!("============================================================");
    println!("                 AMD GPU System Management                  ");
    println!("============================================================");

    let smi = RocmSmi::new(Config::from_env());
    let state = match smi.init(InitFlags::default()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[-] Initialization failed: {e}");
            eprintln!("    (Ensure the amdgpu driver is loaded)");
            return Err(e);
        }
    };

    match state.driver_version() {
        Ok(v) => println!("[+] Driver version: {v}"),
        Err(e) => println!("[-] Driver version: {e}"),
    }
    println!("[+] Devices: {}", state.num_devices());

    for dv in 0..state.num_devices() {
        println!("\n------------------------------------------------------------");
        println!(" Device {dv}");
        println!("------------------------------------------------------------");

        if let (Ok(vendor), Ok(device)) = (state.vendor_id(dv), state.dev_id(dv)) {
            println!("    PCI ID:        {vendor:04x}:{device:04x}");
        }
        println!("    BDF:           0x{:x}", state.pci_id(dv)?);
        if let Ok(minor) = state.drm_render_minor(dv) {
            println!("    Render minor:  {minor}");
        }
        if let Ok(vbios) = state.vbios_version(dv) {
            println!("    VBIOS:         {vbios}");
        }
        if let Ok(level) = state.perf_level(dv) {
            println!("    Perf level:    {}", level.keyword());
        }
        if let Ok(busy) = state.busy_percent(dv) {
            println!("    GPU busy:      {busy}%");
        }
        if let Ok(t) = state.temp_metric(dv, TempSensor::Edge, TempMetric::Current) {
            println!("    Edge temp:     {:.1} C", t as f64 / 1000.0);
        }
        if let Ok(p) = state.power_average(dv, 0) {
            println!("    Power:         {:.1} W", p as f64 / 1_000_000.0);
        }

        for clock in [ClockType::Sys, ClockType::Mem] {
            if let Ok(freqs) = state.gpu_clk_freq(dv, clock) {
                print_clocks(&format!("{clock:?} clock"), &freqs);
            }
        }

        let funcs = state.device(dv)?.supported_funcs().len();
        println!("    Supported API: {funcs} functions");
    }

    if state.num_devices() > 1 {
        println!("\n[+] Topology:");
        for src in 0..state.num_devices() {
            for dst in (src + 1)..state.num_devices() {
                match topology::gpu_path(&state, src, dst) {
                    Ok(p) => println!(
                        "    {src} <-> {dst}: {:?}, {} hops, weight {}",
                        p.link_type, p.hops, p.weight
                    ),
                    Err(e) => println!("    {src} <-> {dst}: {e}"),
                }
            }
        }
    }

    match state.compute_processes() {
        Ok(procs) if !procs.is_empty() => {
            println!("\n[+] Compute processes:");
            for p in procs {
                println!("    pid {:>7}  vram {} MB", p.process_id, p.vram_usage / 1024 / 1024);
            }
        }
        _ => println!("\n[+] No compute processes"),
    }

    smi.shutdown()
}
