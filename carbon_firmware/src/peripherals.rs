//! Device initialisation. Brings up the pieces `carbon_sequencer` needs a
//! concrete transport for (DIN1 MIDI, the RTIC monotonic timer) and
//! leaves the out-of-scope collaborators (panel, LCD, CV DAC, flash,
//! power) to whatever [`crate::collaborators`] implementation the board
//! build plugs in.
use embedded_midi;
use fugit::RateExtU32;
use rp_pico::{
    hal::{
        clocks::{self, Clock},
        gpio::{
            pin::bank0::{Gpio16, Gpio17},
            FunctionUart, Pin,
        },
        pac::{self, RESETS, TIMER, UART0},
        sio::Sio,
        timer::{monotonic::Monotonic, Alarm0},
        uart::{DataBits, Reader, StopBits, UartConfig, UartPeripheral, Writer},
        Timer, Watchdog,
    },
    XOSC_CRYSTAL_FREQ,
};

type MidiOutUartPin = Pin<Gpio16, FunctionUart>;
type MidiInUartPin = Pin<Gpio17, FunctionUart>;
type MidiUartPins = (MidiOutUartPin, MidiInUartPin);

pub type MidiIn = embedded_midi::MidiIn<Reader<UART0, MidiUartPins>>;
pub type MidiOut = embedded_midi::MidiOut<Writer<UART0, MidiUartPins>>;

/// MIDI baud rate, fixed by the wire protocol.
const MIDI_BAUD: u32 = 31_250;

pub fn setup(mut pac: pac::Peripherals) -> (MidiIn, MidiOut, Monotonic<Alarm0>) {
    let sio = Sio::new(pac.SIO);
    let pins = rp_pico::Pins::new(
        pac.IO_BANK0,
        pac.PADS_BANK0,
        sio.gpio_bank0,
        &mut pac.RESETS,
    );

    let mut watchdog = Watchdog::new(pac.WATCHDOG);
    let clocks = clocks::init_clocks_and_plls(
        XOSC_CRYSTAL_FREQ,
        pac.XOSC,
        pac.CLOCKS,
        pac.PLL_SYS,
        pac.PLL_USB,
        &mut pac.RESETS,
        &mut watchdog,
    )
    .ok()
    .expect("init_clocks_and_plls should succeed");

    let (midi_in, midi_out) = new_midi_uart(
        pac.UART0,
        pins.gpio16.into_mode::<FunctionUart>(),
        pins.gpio17.into_mode::<FunctionUart>(),
        &mut pac.RESETS,
        clocks.peripheral_clock.freq(),
    );

    (midi_in, midi_out, new_monotonic_timer(pac.TIMER, &mut pac.RESETS))
}

fn new_monotonic_timer(timer: TIMER, resets: &mut RESETS) -> Monotonic<Alarm0> {
    let mut timer = Timer::new(timer, resets);
    let monotonic_alarm = timer.alarm_0().unwrap();
    Monotonic::new(timer, monotonic_alarm)
}

fn new_midi_uart(
    uart: UART0,
    out_pin: MidiOutUartPin,
    in_pin: MidiInUartPin,
    resets: &mut RESETS,
    peripheral_clock_freq: fugit::HertzU32,
) -> (MidiIn, MidiOut) {
    let midi_uart_pins = (out_pin, in_pin);
    let uart_config = UartConfig::new(MIDI_BAUD.Hz(), DataBits::Eight, None, StopBits::One);
    let mut midi_uart = UartPeripheral::new(uart, midi_uart_pins, resets)
        .enable(uart_config, peripheral_clock_freq)
        .expect("enabling uart for midi should succeed");
    midi_uart.enable_rx_interrupt();
    let (midi_reader, midi_writer) = midi_uart.split();
    (
        embedded_midi::MidiIn::new(midi_reader),
        embedded_midi::MidiOut::new(midi_writer),
    )
}
