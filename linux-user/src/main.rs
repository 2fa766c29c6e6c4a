use std::path::Path;
use std::process;

use qdbt_exec::dispatch;
use qdbt_frontend::rv32::cpu::CPUState;
use qdbt_linux_user::logger;
use qdbt_linux_user::ukernel::{init_thread, Ukernel};

fn usage() -> ! {
    eprintln!("usage: qdbt-rv32 [--logs a:b:c] [--aot] -- <elf> [args...]");
    process::exit(1);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Everything after "--" belongs to the guest.
    let Some(sep) = args.iter().position(|a| a == "--") else {
        eprintln!("args must contain \"--\"");
        usage();
    };
    let guest_args: Vec<&str> = args[sep + 1..].iter().map(|s| s.as_str()).collect();
    if guest_args.is_empty() {
        eprintln!("empty guest args");
        usage();
    }

    let mut log_streams = Vec::new();
    let mut aot_mode = false;
    let mut i = 1;
    while i < sep {
        match args[i].as_str() {
            "--logs" => {
                i += 1;
                if i >= sep {
                    usage();
                }
                log_streams.extend(args[i].split(':').map(str::to_owned));
            }
            "--aot" => aot_mode = true,
            "--help" => usage(),
            a => {
                eprintln!("unknown option {a}");
                usage();
            }
        }
        i += 1;
    }
    logger::init(log_streams);

    let guest_path = Path::new(guest_args[0]);

    qdbt_mmu::init();
    let mut uk = Ukernel::new();
    let elf = uk
        .load_elf(guest_path, &guest_args)
        .unwrap_or_else(|e| {
            eprintln!("failed to load {}: {e}", guest_path.display());
            process::exit(1);
        });

    if aot_mode {
        // Offline compilation from the recorded profile.
        qdbt_aot::compile::compile_aot(guest_path);
        return;
    }

    qdbt_tcache::init();
    dispatch::init();

    qdbt_aot::profile::init(guest_path);
    qdbt_tcache::set_translate_hook(qdbt_aot::profile::on_translate);
    qdbt_aot::boot::boot_aot(guest_path);

    let mut state = CPUState::new();
    init_thread(&mut state, &elf);
    state.ip = elf.entry;

    let code = uk.run(&mut state);
    if let Err(e) = qdbt_aot::profile::save() {
        log::warn!(target: "aot", "failed to save profile: {e}");
    }
    process::exit(code);
}
