#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

mod collaborators;
mod flash;
mod midi_io;
mod peripherals;

use panic_probe as _;

/// RTIC app wiring `carbon_sequencer` to an RP2040 board. This module owns
/// the fixed periodic task order (delay, panel scan, realtime sequencer,
/// MIDI I/O, flash I/O, USB I/O, config-store writeback, CV processing,
/// power control) and the trait boundaries the out-of-scope collaborators
/// (panel, LCD, SPI flash, SPI DAC, power) plug into. It implements none
/// of those collaborators itself — see `collaborators.rs` for the `No*`
/// stand-ins used until real drivers land.
#[rtic::app(
    device = rp_pico::hal::pac,
    peripherals = true,
    dispatchers = [USBCTRL_IRQ, DMA_IRQ_0, DMA_IRQ_1, PWM_IRQ_WRAP]
)]
mod app {
    use alloc_cortex_m::CortexMHeap;
    use defmt::{error, info, trace};
    use defmt_rtt as _;
    use fugit::MicrosDurationU64;
    use midi_types::MidiMessage;
    use nb::block;
    use rp_pico::hal::timer::{monotonic::Monotonic, Alarm0};

    use carbon_sequencer::clock::{Clock, TASK_INTERVAL_US as CORE_TASK_INTERVAL_US};
    use carbon_sequencer::config_store::ConfigStore;
    use carbon_sequencer::controller::Controller;
    use carbon_sequencer::cv_proc::CvProcessor;
    use carbon_sequencer::engine::Engine;
    use carbon_sequencer::event_bus::EventBus;
    use carbon_sequencer::outproc::OutputProcessor;
    use carbon_sequencer::pattern::PatternBank;
    use carbon_sequencer::rng::SequencerRng;
    use carbon_sequencer::song::SongStore;

    use crate::collaborators::{
        CvDacWriter, Lcd, NoCvDac, NoLcd, NoPanel, NoPowerMonitor, PanelInput, PowerMonitor,
        POWER_CUTOFF_MV,
    };
    use crate::flash::NullFlash;
    use crate::midi_io::{self, PORT_DIN1};
    use crate::peripherals::{setup, MidiIn, MidiOut};

    #[global_allocator]
    static ALLOCATOR: CortexMHeap = CortexMHeap::empty();
    const HEAP_SIZE_BYTES: usize = 8 * 1024;

    /// Scheduling period for the bulk of the fixed task order.
    const SCHEDULER_INTERVAL: MicrosDurationU64 = MicrosDurationU64::micros(CORE_TASK_INTERVAL_US);

    /// External flash layout: songs from byte 0, config region at a fixed
    /// high offset sized one sector.
    const SONG_STORE_BASE: u32 = 0;
    const CONFIG_STORE_BASE: u32 = 0x160_000;
    const CONFIG_STORE_SECTOR_SIZE: u32 = 4096;
    const CONFIG_STORE_NUM_SECTORS: u32 = 1;
    const FLASH_CAPACITY: u32 = CONFIG_STORE_BASE + CONFIG_STORE_SECTOR_SIZE;

    #[monotonic(binds = TIMER_IRQ_0, default = true)]
    type TimerMonotonic = Monotonic<Alarm0>;

    /// RTIC shared resources: every piece of core state, each owned by
    /// exactly one module, reached only through this struct's lock guards
    /// instead of free-floating globals.
    #[shared]
    struct Shared {
        song_store: SongStore,
        config_store: ConfigStore,
        patterns: PatternBank,
        controller: Controller,
        engine: Engine,
        clock: Clock,
        outproc: OutputProcessor,
        cv: CvProcessor,
        bus: EventBus,
    }

    #[local]
    struct Local {
        midi_in: MidiIn,
        midi_out: MidiOut,
        flash: NullFlash,
        panel: NoPanel,
        lcd: NoLcd,
        cv_dac: NoCvDac,
        power: NoPowerMonitor,
        rng: SequencerRng,
    }

    #[init]
    fn init(ctx: init::Context) -> (Shared, Local, init::Monotonics) {
        info!("[init] carbon sequencer core starting");

        unsafe {
            ALLOCATOR.init(cortex_m_rt::heap_start() as usize, HEAP_SIZE_BYTES);
        }

        defmt::timestamp!("{=u64:us}", {
            monotonics::now().duration_since_epoch().to_micros()
        });

        let (midi_in, midi_out, monotonic_timer) = setup(ctx.device);

        let mut bus = EventBus::new();
        let mut song_store = SongStore::new(SONG_STORE_BASE);
        song_store.clear(&mut bus);
        let mut config_store = ConfigStore::new(
            CONFIG_STORE_BASE,
            CONFIG_STORE_SECTOR_SIZE,
            CONFIG_STORE_NUM_SECTORS,
        );
        let mut flash = NullFlash::new(FLASH_CAPACITY, CONFIG_STORE_SECTOR_SIZE);
        config_store.start_load(&mut flash);
        // Kick off loading the last-used song slot; `scheduler_tick`'s flash
        // I/O stage polls this to completion (or to `LOAD_ERROR` + `clear()`
        // on hardware with no flash wired up yet).
        song_store.load(0, &mut flash);

        scheduler_tick::spawn_after(SCHEDULER_INTERVAL).expect("scheduler_tick should spawn");

        info!("[init] complete");

        (
            Shared {
                song_store,
                config_store,
                patterns: PatternBank::default(),
                controller: Controller::new(),
                engine: Engine::new(),
                clock: Clock::new(),
                outproc: OutputProcessor::new(),
                cv: CvProcessor::new(),
                bus,
            },
            Local {
                midi_in,
                midi_out,
                flash,
                panel: NoPanel,
                lcd: NoLcd,
                cv_dac: NoCvDac,
                power: NoPowerMonitor,
                rng: SequencerRng::new(),
            },
            init::Monotonics(monotonic_timer),
        )
    }

    /// Handle MIDI input. Triggered by a byte being received on DIN1's
    /// UART. Realtime bytes drive the clock directly (timing-sensitive);
    /// channel voice messages feed live input/record via
    /// [`midi_io::handle_din1_rx`].
    #[task(
        binds = UART0_IRQ,
        priority = 4,
        shared = [clock, engine, controller, song_store, bus],
        local = [midi_in]
    )]
    fn uart0_irq(mut ctx: uart0_irq::Context) {
        trace!("[uart0_irq] start");

        if let Ok(message) = block!(ctx.local.midi_in.read()) {
            (
                ctx.shared.clock,
                ctx.shared.engine,
                ctx.shared.controller,
                ctx.shared.song_store,
                ctx.shared.bus,
            )
                .lock(|clock, engine, controller, song_store, bus| {
                    let tick = clock.tick_pos();
                    midi_io::handle_din1_rx(
                        message,
                        tick,
                        clock,
                        engine,
                        controller,
                        song_store.song_mut(),
                        bus,
                    );
                });
        }

        trace!("[uart0_irq] done");
    }

    /// Send one outgoing MIDI message. A task (rather than a direct write
    /// from the scheduler tick) so a burst of note-offs doesn't block
    /// higher-priority work.
    #[task(priority = 3, capacity = 96, local = [midi_out])]
    fn midi_send(ctx: midi_send::Context, port: u8, message: MidiMessage) {
        midi_io::log_outgoing(port, &message);
        if port != PORT_DIN1 {
            // Only the DIN1 UART is wired up on this board; other ports
            // (DIN2, USB host/device) are out-of-scope transports that
            // would be driven by their own task here.
            return;
        }
        ctx.local
            .midi_out
            .write(&message)
            .expect("midi_out.write(message) should succeed");
    }

    /// The fixed per-tick task order: delay, panel scan, realtime
    /// sequencer, MIDI I/O (USB/DIN2 stubs; DIN1 is IRQ-driven above),
    /// flash I/O, config-store writeback, CV processing, power control.
    #[task(
        priority = 2,
        shared = [song_store, config_store, patterns, engine, clock, outproc, cv, bus],
        local = [flash, panel, lcd, cv_dac, power, rng],
    )]
    fn scheduler_tick(ctx: scheduler_tick::Context) {
        let start = monotonics::now();
        trace!("[scheduler_tick] start");

        // 1. delay — nothing to do without a real timing peripheral beyond
        // the RTIC monotonic already driving this task's cadence.

        // 2. panel scan
        for _event in ctx.local.panel.poll() {
            // A real panel driver's button/encoder edges would route here
            // into `controller`'s adjust_*/set_* surface; `NoPanel` never
            // produces any.
        }

        (
            ctx.shared.song_store,
            ctx.shared.config_store,
            ctx.shared.patterns,
            ctx.shared.engine,
            ctx.shared.clock,
            ctx.shared.outproc,
            ctx.shared.cv,
            ctx.shared.bus,
        )
            .lock(|song_store, config_store, patterns, engine, clock, outproc, cv, bus| {
                // 3. realtime sequencer. `tick_task` owns `bus` for the
                // duration of the call (it fires beat/run-state events
                // itself), so the generated tick numbers are collected
                // first and `engine.tick` — which needs its own `&mut
                // EventBus` — runs afterwards, once that borrow has ended.
                let mut due_ticks: heapless::Vec<u32, 8> = heapless::Vec::new();
                clock.tick_task(bus, |tick_pos| {
                    let _ = due_ticks.push(tick_pos);
                });

                let song = song_store.song_mut();
                let running = clock.running();
                let rng = ctx.local.rng;
                for tick_pos in due_ticks {
                    match engine.tick(tick_pos, running, song, patterns, outproc, cv, bus, || {
                        rng.next_u8()
                    }) {
                        Ok(messages) => {
                            for (port, message) in messages {
                                if midi_send::spawn(port, message).is_err() {
                                    error!("[scheduler_tick] midi_send queue full, dropping message");
                                }
                            }
                        }
                        Err(err) => {
                            error!("[scheduler_tick] engine tick error: {}", err);
                        }
                    }
                }

                // 4. MIDI I/O (USB host/device, DIN2) — out-of-scope
                // transports; DIN1 is serviced by `uart0_irq` above.

                // 5. flash I/O
                song_store.poll(0, ctx.local.flash, bus);

                // 6. USB I/O — out of scope.

                // 7. config-store writeback
                config_store.tick(ctx.local.flash);

                // 8. CV processing
                for (channel, output) in cv.outputs().iter().enumerate() {
                    ctx.local.cv_dac.write_cv(channel as u8, output.cv);
                    ctx.local.cv_dac.set_gate(channel as u8, output.gate);
                }

                // 9. power control
                if ctx.local.power.dc_millivolts() < POWER_CUTOFF_MV {
                    ctx.local.power.cut_analog_power();
                    ctx.local.lcd.present(&[]);
                    error!("[scheduler_tick] power below cutoff, analog rail cut");
                }
            });

        scheduler_tick::spawn_after(SCHEDULER_INTERVAL).expect("scheduler_tick should respawn");

        trace!(
            "[scheduler_tick] elapsed_time={}",
            (monotonics::now() - start).to_micros()
        );
    }

    // idle task needed because default RTIC idle task calls wfi(), which breaks rtt
    #[idle]
    fn task_main(_: task_main::Context) -> ! {
        loop {
            cortex_m::asm::nop();
        }
    }

    // OOM handler
    #[alloc_error_handler]
    fn alloc_error(_layout: core::alloc::Layout) -> ! {
        error!("out of memory");
        panic!("out of memory");
    }
}
