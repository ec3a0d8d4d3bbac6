// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RP2040 ghost disk firmware.
//!
//! Enumerates as a composite device: a CDC-ACM serial console and a USB mass
//! storage drive showing a single file, `main.py`, whose contents live in
//! RAM. Everything about the disk lives in the `ghost_disk` library; this file
//! is the RP2040 half: clocks, the USB controller, descriptors and control
//! requests, and shuttling endpoint buffers in and out of the library.
//!
//! Like the controller setup it is built on, there are no HALs, callbacks or
//! interrupts. The main loop polls the controller's status bits and handles
//! whatever is set.
//!
//! `unsafe` shows up in two places. Register writes that `rp2040_pac` marks
//! unsafe for no particular reason carry no comment. Access to endpoint
//! buffers in USB DPRAM is actually unsafe and is commented where it happens.

#![no_std]
#![no_main]

use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, Ordering};

use byteorder::LittleEndian;
use cortex_m_rt::entry;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16, U32};

use ghost_disk::ring::CDC_RING_SIZE;
use ghost_disk::usb::{send_polling, CONSOLE_TX_TRIES, MAX_PACKET};
use ghost_disk::{Busy, ClassResponse, DiskConfig, EndpointIo, EndpointMap, GhostDisk};

use panic_halt as _;

// GPIOs toggled around USB events, for watching the event flow on a logic
// analyzer.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-pico")] {
        const LED_PIN: u8 = 25; // any activity
        const SETUP_PIN: u8 = 0; // SETUP request being handled
        const BUFF_PIN: u8 = 1; // buffer event
        const RESET_PIN: u8 = 2; // bus reset
        const EP_PIN: [u8; 3] = [3, 4, 5]; // EP0, console, disk
    } else if #[cfg(feature = "target-feather")] {
        const LED_PIN: u8 = 13;
        const SETUP_PIN: u8 = 0;
        const BUFF_PIN: u8 = 1;
        const RESET_PIN: u8 = 2;
        const EP_PIN: [u8; 3] = [3, 4, 5];
    } else {
        compile_error!("missing or unknown target-* feature");
    }
}

/// What the drive holds before the host writes anything.
const DEFAULT_SCRIPT: &[u8] = b"from machine import Pin\n\
from time import sleep\n\
led = Pin(25, Pin.OUT)\n\
while True:\n    \
led.on()\n    \
sleep(.3)\n    \
led.off()\n    \
sleep(.3)\n";

#[entry]
fn main() -> ! {
    let p = rp2040_pac::Peripherals::take().unwrap();

    //////////////////////////////////////////////////////////////////////////
    // Diagnostic pins. IO bank 0 has to come out of reset first; SIO doesn't.

    p.RESETS.reset.modify(|_, w| w.io_bank0().clear_bit());
    while !p.RESETS.reset_done.read().io_bank0().bit() {}

    for pin in [LED_PIN, SETUP_PIN, BUFF_PIN, RESET_PIN].into_iter().chain(EP_PIN) {
        p.IO_BANK0.gpio[pin as usize].gpio_ctrl.write(|w| w.funcsel().sio());
        p.SIO.gpio_oe_set.write(|w| unsafe { w.bits(1 << pin) });
    }

    clocks_init(&p);
    usb_init(&p);

    let eps = DiskConfig::DEFAULT.endpoints;
    let mut disk: GhostDisk = GhostDisk::new(DiskConfig {
        initial_contents: DEFAULT_SCRIPT,
        ..DiskConfig::DEFAULT
    });
    let mut io = RpEndpoints { dpram: &p.USBCTRL_DPRAM };

    // Attach. The host sees us from here on.
    p.USBCTRL_REGS.sie_ctrl.modify(|_, w| w.pullup_en().set_bit());

    //////////////////////////////////////////////////////////////////////////
    // Main loop state.

    // SET_ADDRESS takes effect after its status stage, which still goes out
    // on address 0.
    let mut new_address = None;
    let mut configured = false;
    // Bulk OUT endpoints have been armed since configuration.
    let mut started = false;
    // Rest of a multi-packet EP0 IN data stage.
    let mut ep0_in = Ep0InStage::default();
    // EP0 OUT is armed for a SET_LINE_CODING data stage.
    let mut line_coding_pending = false;
    // The host's serial settings. We have no UART behind the console, so this
    // is only remembered and handed back.
    let mut line_coding = LineCoding::DEFAULT;
    let mut tmp = [0u8; MAX_PACKET];

    loop {
        let ints = p.USBCTRL_REGS.ints.read();

        if ints.setup_req().bit() {
            raise_pin(&p.SIO, LED_PIN);
            raise_pin(&p.SIO, SETUP_PIN);
            p.USBCTRL_REGS.sie_status.write(|w| w.setup_rec().set_bit());

            let mut raw = [0; 8];
            raw[..4].copy_from_slice(&p.USBCTRL_DPRAM.setup_packet_low.read().bits().to_le_bytes());
            raw[4..].copy_from_slice(&p.USBCTRL_DPRAM.setup_packet_high.read().bits().to_le_bytes());
            let setup = UsbSetupPacket::read_from(&raw[..]).unwrap_or_default();

            // Data and status stages after SETUP both start at DATA1.
            EP0_IN.next_pid_1.store(true, Ordering::Relaxed);
            EP0_OUT.next_pid_1.store(true, Ordering::Relaxed);
            // A new SETUP cancels whatever the last one left unfinished.
            ep0_in = Ep0InStage::default();
            line_coding_pending = false;

            let dpram = &p.USBCTRL_DPRAM;
            let dir = UsbDir::of_endpoint_addr(setup.request_type);
            let kind = UsbRequestKind::from_u8((setup.request_type >> 5) & 0b11);
            let requested = usize::from(setup.length.get());

            match (kind, dir) {
                (Some(UsbRequestKind::Standard), _) => {
                    match (dir, UsbSetupRequest::from_u8(setup.request)) {
                        (UsbDir::Out, Some(UsbSetupRequest::SetAddress)) => {
                            new_address = Some(setup.value.get() as u8);
                            usb_acknowledge_out_request(dpram);
                        }
                        (UsbDir::Out, Some(UsbSetupRequest::SetConfiguration)) => {
                            configured = true;
                            usb_acknowledge_out_request(dpram);
                        }
                        (UsbDir::Out, _) => {
                            // Anything else we don't understand gets a status
                            // stage anyway, so the host doesn't sit there
                            // waiting on NAKs.
                            usb_acknowledge_out_request(dpram);
                        }
                        (UsbDir::In, Some(UsbSetupRequest::GetDescriptor)) => {
                            match UsbDescType::from_u16(setup.value.get() >> 8) {
                                Some(UsbDescType::Device) => {
                                    ep0_in = Ep0InStage::start(dpram, DEVICE_DESCRIPTOR.as_bytes(), requested);
                                }
                                Some(UsbDescType::Config) => {
                                    // Configuration, interfaces, functional
                                    // and endpoint descriptors all in one go,
                                    // cut to whatever the host asked for.
                                    ep0_in = Ep0InStage::start(dpram, CONFIGURATION.as_bytes(), requested);
                                }
                                Some(UsbDescType::String) => {
                                    let bytes = match setup.value.get() & 0xFF {
                                        0 => Some(LANG_DESCRIPTOR),
                                        1 => Some(string_descriptor(&disk.config().vendor, &mut tmp)),
                                        2 => Some(string_descriptor(&disk.config().product, &mut tmp)),
                                        _ => None,
                                    };
                                    match bytes {
                                        Some(b) => usb_start_tx(dpram, &EP0_IN, &b[..b.len().min(requested)]),
                                        None => usb_stall_ep0(&p.USBCTRL_REGS, dpram),
                                    }
                                }
                                _ => usb_stall_ep0(&p.USBCTRL_REGS, dpram),
                            }
                        }
                        (UsbDir::In, _) => {
                            // GET_STATUS and friends. Hosts get by without.
                        }
                    }
                }
                (Some(UsbRequestKind::Class), _) => {
                    let interface = setup.index.get() as u8;
                    if interface == MSC_INTERFACE {
                        match disk.class_request(setup.request) {
                            ClassResponse::Data(b) => {
                                usb_start_tx(dpram, &EP0_IN, &b[..b.len().min(requested)]);
                            }
                            ClassResponse::Ack => usb_acknowledge_out_request(dpram),
                            ClassResponse::Unsupported => usb_stall_ep0(&p.USBCTRL_REGS, dpram),
                        }
                    } else {
                        match CdcRequest::from_u8(setup.request) {
                            Some(CdcRequest::SetLineCoding) => {
                                line_coding_pending = true;
                                usb_start_rx(dpram, &EP0_OUT, MAX_PACKET);
                            }
                            Some(CdcRequest::GetLineCoding) => {
                                let b = line_coding.as_bytes();
                                usb_start_tx(dpram, &EP0_IN, &b[..b.len().min(requested)]);
                            }
                            Some(CdcRequest::SetControlLineState) => {
                                usb_acknowledge_out_request(dpram);
                            }
                            None => usb_stall_ep0(&p.USBCTRL_REGS, dpram),
                        }
                    }
                }
                _ => {
                    // Vendor requests, or reserved type bits.
                    usb_stall_ep0(&p.USBCTRL_REGS, dpram);
                }
            }
            lower_pin(&p.SIO, SETUP_PIN);
        }

        if ints.buff_status().bit() {
            raise_pin(&p.SIO, LED_PIN);
            raise_pin(&p.SIO, BUFF_PIN);

            let orig_bufbits = p.USBCTRL_REGS.buff_status.read().bits();
            let mut bufbits = orig_bufbits;

            while bufbits != 0 {
                // Buffer status bits come in IN/OUT pairs per endpoint number.
                let index = bufbits.trailing_zeros();
                bufbits ^= 1 << index;
                let epnum = (index >> 1) as u8;
                let dir = if index & 1 == 0 { UsbDir::In } else { UsbDir::Out };
                let ep = match endpoint(dir.endpoint(epnum)) {
                    Some(ep) => ep,
                    None => continue,
                };
                let pin = activity_pin(epnum);
                if let Some(pin) = pin {
                    raise_pin(&p.SIO, pin);
                }

                let bc = p.USBCTRL_DPRAM.ep_buffer_control[ep.buffer_control_index()].read();
                // The hardware clears AVAILABLE when it hands the buffer
                // back, so it is ours until we arm it again.
                assert!(!bc.available_0().bit());
                let len = usize::from(bc.length_0().bits()).min(MAX_PACKET);
                // Safety: the buffer belongs to this endpoint alone, and the
                // controller won't touch it until the next usb_start_tx or
                // usb_start_rx on this endpoint, none of which happens while
                // `data` is alive.
                let data = unsafe { core::slice::from_raw_parts(ep.buffer(), len) };

                match ep.address {
                    EP0_IN_ADDR => {
                        if let Some(a) = new_address.take() {
                            p.USBCTRL_REGS.addr_endp.write(|w| unsafe { w.address().bits(a) });
                        } else if !ep0_in.next(&p.USBCTRL_DPRAM) {
                            // Data stage done; take the host's status
                            // stage.
                            usb_start_rx(&p.USBCTRL_DPRAM, &EP0_OUT, 0);
                        }
                    }
                    EP0_OUT_ADDR => {
                        if line_coding_pending {
                            line_coding_pending = false;
                            if let Some((lc, _)) = LayoutVerified::<_, LineCoding>::new_from_prefix(data) {
                                line_coding = *lc;
                            }
                            usb_acknowledge_out_request(&p.USBCTRL_DPRAM);
                        }
                    }
                    _ if dir == UsbDir::Out => {
                        disk.on_data_out(&mut io, epnum, data);
                        usb_start_rx(&p.USBCTRL_DPRAM, ep, MAX_PACKET);
                    }
                    _ => disk.on_data_in_complete(&mut io, epnum, data),
                }

                if let Some(pin) = pin {
                    lower_pin(&p.SIO, pin);
                }
            }
            p.USBCTRL_REGS.buff_status.write(|w| unsafe { w.bits(orig_bufbits) });

            lower_pin(&p.SIO, BUFF_PIN);
        }

        if ints.bus_reset().bit() {
            raise_pin(&p.SIO, LED_PIN);
            raise_pin(&p.SIO, RESET_PIN);
            p.USBCTRL_REGS.sie_status.write(|w| w.bus_reset().set_bit());

            new_address = None;
            configured = false;
            started = false;
            ep0_in = Ep0InStage::default();
            line_coding_pending = false;
            disk.reset();
            for ep in &ENDPOINTS {
                ep.next_pid_1.store(false, Ordering::Relaxed);
                p.USBCTRL_DPRAM.ep_buffer_control[ep.buffer_control_index()]
                    .write(|w| unsafe { w.bits(0) });
            }
            p.USBCTRL_REGS.addr_endp.write(|w| unsafe { w.address().bits(0) });

            lower_pin(&p.SIO, RESET_PIN);
        }

        if configured && !started {
            started = true;
            for ep in ENDPOINTS.iter().filter(|ep| ep.is_out()) {
                usb_start_rx(&p.USBCTRL_DPRAM, ep, MAX_PACKET);
            }
        }

        if started {
            // Echo console input. The ring never holds more than this.
            let mut echo = heapless::Vec::<u8, CDC_RING_SIZE>::new();
            disk.poll(&mut io, &mut |bytes: &[u8]| {
                let _ = echo.extend_from_slice(bytes);
            });
            if !echo.is_empty() {
                let _ = send_polling(&mut io, eps.cdc_in, &echo, CONSOLE_TX_TRIES);
            }

            if disk.take_changed() {
                let size = disk.file().size;
                let _ = write!(disk.console(&mut io), "\r\nmain.py: {} bytes\r\n", size);
            }
        }
        lower_pin(&p.SIO, LED_PIN);
    }
}

////////////////////////////////////////////////////////////////////////////
// Bring-up.

/// Moves the system from the ring oscillator to the crystal, runs the core at
/// 132 MHz off PLL_SYS, and brings PLL_USB up to the 48 MHz USB needs.
fn clocks_init(p: &rp2040_pac::Peripherals) {
    // 12 MHz crystal, then hand clk_ref (and with it clk_sys) over to it.
    p.XOSC.ctrl.write(|w| unsafe { w.bits(0xfab_aa0) });
    while !p.XOSC.status.read().stable().bit() {}
    p.CLOCKS.clk_ref_ctrl.write(|w| w.src().xosc_clksrc());
    while p.CLOCKS.clk_ref_selected.read().bits() != (1 << 2) {}
    p.ROSC.ctrl.write(|w| unsafe { w.bits(0xd1e_fa4) });

    // PLL_SYS: 12 MHz * 132 = 1584 MHz VCO, / (6 * 2) = 132 MHz.
    p.RESETS.reset.modify(|_, w| w.pll_sys().clear_bit());
    while !p.RESETS.reset_done.read().pll_sys().bit() {}
    p.PLL_SYS.cs.write(|w| unsafe { w.refdiv().bits(1) });
    p.PLL_SYS.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(132) });
    p.PLL_SYS.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !p.PLL_SYS.cs.read().lock().bit() {}
    p.PLL_SYS.prim.write(|w| unsafe { w.postdiv1().bits(6).postdiv2().bits(2) });
    p.PLL_SYS.pwr.modify(|_, w| w.postdivpd().clear_bit());

    p.CLOCKS.clk_sys_ctrl.write(|w| w.auxsrc().clksrc_pll_sys());
    p.CLOCKS.clk_sys_ctrl.modify(|_, w| w.src().clksrc_clk_sys_aux());
    while p.CLOCKS.clk_sys_selected.read().bits() != (1 << 1) {}

    p.CLOCKS.clk_peri_ctrl.write(|w| w.auxsrc().clk_sys().enable().set_bit());

    // PLL_USB: 12 MHz * 100 = 1200 MHz VCO, / (5 * 5) = 48 MHz.
    p.RESETS.reset.modify(|_, w| w.pll_usb().clear_bit());
    while !p.RESETS.reset_done.read().pll_usb().bit() {}
    p.PLL_USB.cs.write(|w| unsafe { w.refdiv().bits(1) });
    p.PLL_USB.fbdiv_int.write(|w| unsafe { w.fbdiv_int().bits(100) });
    p.PLL_USB.pwr.write(|w| w.pd().clear_bit().vcopd().clear_bit());
    while !p.PLL_USB.cs.read().lock().bit() {}
    p.PLL_USB.prim.write(|w| unsafe { w.postdiv1().bits(5).postdiv2().bits(5) });
    p.PLL_USB.pwr.modify(|_, w| w.postdivpd().clear_bit());

    p.CLOCKS.clk_usb_ctrl.write(|w| w.auxsrc().clksrc_pll_usb().enable().set_bit());
}

/// Resets the USB controller into device mode and configures every endpoint
/// in [`ENDPOINTS`]. Leaves the pull-up off.
fn usb_init(p: &rp2040_pac::Peripherals) {
    p.RESETS.reset.modify(|_, w| w.usbctrl().set_bit());
    p.RESETS.reset.modify(|_, w| w.usbctrl().clear_bit());
    while !p.RESETS.reset_done.read().usbctrl().bit() {}

    p.USBCTRL_DPRAM.setup_packet_low.write(|w| unsafe { w.bits(0) });
    p.USBCTRL_DPRAM.setup_packet_high.write(|w| unsafe { w.bits(0) });
    for epc in &p.USBCTRL_DPRAM.ep_control {
        epc.write(|w| unsafe { w.bits(0) });
    }
    for epb in &p.USBCTRL_DPRAM.ep_buffer_control {
        epb.write(|w| unsafe { w.bits(0) });
    }

    p.USBCTRL_REGS.usb_muxing.write(|w| w.to_phy().set_bit().softcon().set_bit());
    // Not every board wires up VBUS sensing, so pretend it's always there.
    p.USBCTRL_REGS.usb_pwr.write(|w| w.vbus_detect().set_bit().vbus_detect_override_en().set_bit());
    p.USBCTRL_REGS.main_ctrl.write(|w| w.controller_en().set_bit().host_ndevice().clear_bit());
    p.USBCTRL_REGS.sie_ctrl.write(|w| w.ep0_int_1buf().set_bit());
    p.USBCTRL_REGS.inte.write(|w| w.buff_status().set_bit().bus_reset().set_bit().setup_req().set_bit());

    for ep in &ENDPOINTS {
        if let Some(epci) = ep.control_index() {
            p.USBCTRL_DPRAM.ep_control[epci].write(|w| unsafe {
                w.enable().set_bit()
                    .interrupt_per_buff().set_bit()
                    .endpoint_type().bits(ep.kind as u8)
                    .buffer_address().bits(ep.buffer_offset)
            });
        }
    }
}

////////////////////////////////////////////////////////////////////////////
// Endpoint plumbing.

/// The library's view of the controller: queue a packet on an IN endpoint if
/// its buffer is free.
struct RpEndpoints<'a> {
    dpram: &'a rp2040_pac::USBCTRL_DPRAM,
}

impl EndpointIo for RpEndpoints<'_> {
    fn send(&mut self, endpoint: u8, data: &[u8]) -> Result<(), Busy> {
        let ep = self::endpoint(UsbDir::In.endpoint(endpoint)).ok_or(Busy { endpoint })?;
        if self.dpram.ep_buffer_control[ep.buffer_control_index()].read().available_0().bit() {
            return Err(Busy { endpoint });
        }
        usb_start_tx(self.dpram, ep, data);
        Ok(())
    }
}

/// An EP0 IN data stage, possibly longer than one packet.
#[derive(Default)]
struct Ep0InStage {
    rest: &'static [u8],
    /// The data ends on a packet boundary short of what the host asked for,
    /// so a zero-length packet has to follow.
    zlp: bool,
}

impl Ep0InStage {
    fn start(dpram: &rp2040_pac::USBCTRL_DPRAM, data: &'static [u8], requested: usize) -> Self {
        let data = &data[..data.len().min(requested)];
        let mut stage = Self {
            rest: data,
            zlp: data.len() < requested && data.len() % MAX_PACKET == 0,
        };
        if !stage.next(dpram) {
            usb_start_tx(dpram, &EP0_IN, &[]);
        }
        stage
    }

    /// Queues the next packet. Returns `false` once the stage is complete.
    fn next(&mut self, dpram: &rp2040_pac::USBCTRL_DPRAM) -> bool {
        if !self.rest.is_empty() {
            let (chunk, rest) = self.rest.split_at(self.rest.len().min(MAX_PACKET));
            usb_start_tx(dpram, &EP0_IN, chunk);
            self.rest = rest;
            true
        } else if self.zlp {
            self.zlp = false;
            usb_start_tx(dpram, &EP0_IN, &[]);
            true
        } else {
            false
        }
    }
}

/// Zero-length status stage for a control OUT.
fn usb_acknowledge_out_request(dpram: &rp2040_pac::USBCTRL_DPRAM) {
    usb_start_tx(dpram, &EP0_IN, &[]);
}

/// Refuses the current control request. The controller disarms the stall on
/// the next SETUP.
fn usb_stall_ep0(regs: &rp2040_pac::USBCTRL_REGS, dpram: &rp2040_pac::USBCTRL_DPRAM) {
    regs.ep_stall_arm.write(|w| w.ep0_in().set_bit().ep0_out().set_bit());
    for ep in [&EP0_IN, &EP0_OUT] {
        dpram.ep_buffer_control[ep.buffer_control_index()].write(|w| w.stall().set_bit());
    }
}

/// Copies `buffer` into the endpoint's DPRAM buffer and hands it to the
/// controller for the next IN.
fn usb_start_tx(dpram: &rp2040_pac::USBCTRL_DPRAM, ep: &EndpointConfig, buffer: &[u8]) {
    assert!(buffer.len() <= MAX_PACKET);
    assert!(UsbDir::of_endpoint_addr(ep.address) == UsbDir::In);

    // Safety: the buffer is ours (AVAILABLE is clear) and is never borrowed
    // as a slice across this call.
    unsafe {
        ep.buffer().copy_from_nonoverlapping(buffer.as_ptr(), buffer.len());
    }

    let np = ep.next_pid_1.load(Ordering::Relaxed);
    dpram.ep_buffer_control[ep.buffer_control_index()].write(|w| unsafe {
        w.pid_0().bit(np)
            .full_0().set_bit()
            .available_0().set_bit()
            .length_0().bits(buffer.len() as u16)
    });
    ep.next_pid_1.store(!np, Ordering::Relaxed);
}

/// Arms an OUT endpoint to take up to `len` bytes.
fn usb_start_rx(dpram: &rp2040_pac::USBCTRL_DPRAM, ep: &EndpointConfig, len: usize) {
    assert!(len <= MAX_PACKET);
    assert!(UsbDir::of_endpoint_addr(ep.address) == UsbDir::Out);

    let np = ep.next_pid_1.load(Ordering::Relaxed);
    dpram.ep_buffer_control[ep.buffer_control_index()].write(|w| unsafe {
        w.pid_0().bit(np)
            .full_0().clear_bit()
            .available_0().set_bit()
            .length_0().bits(len as u16)
    });
    ep.next_pid_1.store(!np, Ordering::Relaxed);
}

fn activity_pin(epnum: u8) -> Option<u8> {
    let eps = DiskConfig::DEFAULT.endpoints;
    let i = if epnum == 0 {
        0
    } else if epnum == eps.msc_in || epnum == eps.msc_out {
        2
    } else {
        1
    };
    EP_PIN.get(i).copied()
}

////////////////////////////////////////////////////////////////////////////
// Endpoint table.

struct EndpointConfig {
    address: u8,
    kind: UsbTransferType,
    /// Offset of this endpoint's 64-byte buffer from the base of DPRAM.
    buffer_offset: u16,
    /// `true` if the next packet is DATA1.
    next_pid_1: AtomicBool,
}

impl EndpointConfig {
    const fn new(address: u8, kind: UsbTransferType, buffer_offset: u16) -> Self {
        Self {
            address,
            kind,
            buffer_offset,
            next_pid_1: AtomicBool::new(false),
        }
    }

    fn number(&self) -> usize {
        usize::from(self.address & 0x0F)
    }

    fn is_out(&self) -> bool {
        UsbDir::of_endpoint_addr(self.address) == UsbDir::Out
    }

    /// Index into `ep_control`, which starts at EP1 IN. EP0 has none.
    fn control_index(&self) -> Option<usize> {
        match self.number() {
            0 => None,
            n => Some((n - 1) * 2 + usize::from(self.is_out())),
        }
    }

    /// Index into `ep_buffer_control`: IN then OUT for each number.
    fn buffer_control_index(&self) -> usize {
        self.number() * 2 + usize::from(self.is_out())
    }

    fn buffer(&self) -> *mut u8 {
        (rp2040_pac::USBCTRL_DPRAM::ptr() as *mut u8).wrapping_add(usize::from(self.buffer_offset))
    }
}

const EPS: EndpointMap = DiskConfig::DEFAULT.endpoints;

const EP0_IN_ADDR: u8 = UsbDir::In.endpoint(0);
const EP0_OUT_ADDR: u8 = UsbDir::Out.endpoint(0);
const NOTIFY_ADDR: u8 = UsbDir::In.endpoint(EPS.cdc_notify);
const CDC_OUT_ADDR: u8 = UsbDir::Out.endpoint(EPS.cdc_out);
const CDC_IN_ADDR: u8 = UsbDir::In.endpoint(EPS.cdc_in);
const MSC_IN_ADDR: u8 = UsbDir::In.endpoint(EPS.msc_in);
const MSC_OUT_ADDR: u8 = UsbDir::Out.endpoint(EPS.msc_out);

// EP0 has a fixed buffer at 0x100, shared by both directions. The rest are
// ours to place from 0x180 up, 64-byte aligned.
static EP0_IN: EndpointConfig = EndpointConfig::new(EP0_IN_ADDR, UsbTransferType::Control, 0x100);
static EP0_OUT: EndpointConfig = EndpointConfig::new(EP0_OUT_ADDR, UsbTransferType::Control, 0x100);
static ENDPOINTS: [EndpointConfig; 5] = [
    EndpointConfig::new(NOTIFY_ADDR, UsbTransferType::Interrupt, 0x180),
    EndpointConfig::new(CDC_OUT_ADDR, UsbTransferType::Bulk, 0x1C0),
    EndpointConfig::new(CDC_IN_ADDR, UsbTransferType::Bulk, 0x200),
    EndpointConfig::new(MSC_IN_ADDR, UsbTransferType::Bulk, 0x240),
    EndpointConfig::new(MSC_OUT_ADDR, UsbTransferType::Bulk, 0x280),
];

fn endpoint(address: u8) -> Option<&'static EndpointConfig> {
    match address {
        EP0_IN_ADDR => Some(&EP0_IN),
        EP0_OUT_ADDR => Some(&EP0_OUT),
        a => ENDPOINTS.iter().find(|ep| ep.address == a),
    }
}

////////////////////////////////////////////////////////////////////////////
// Descriptors.

const CDC_COMM_INTERFACE: u8 = 0;
const CDC_DATA_INTERFACE: u8 = 1;
const MSC_INTERFACE: u8 = 2;

const fn le16(x: u16) -> U16<LittleEndian> {
    U16::from_bytes(x.to_le_bytes())
}

const fn endpoint_descriptor(address: u8, kind: UsbTransferType, interval: u8) -> UsbEndpointDescriptor {
    UsbEndpointDescriptor {
        length: core::mem::size_of::<UsbEndpointDescriptor>() as u8,
        descriptor_type: UsbDescType::Endpoint,
        endpoint_address: address,
        attributes: kind as u8,
        max_packet_size: le16(MAX_PACKET as u16),
        interval,
    }
}

const fn interface_descriptor(number: u8, endpoints: u8, class: [u8; 3]) -> UsbInterfaceDescriptor {
    UsbInterfaceDescriptor {
        length: core::mem::size_of::<UsbInterfaceDescriptor>() as u8,
        descriptor_type: UsbDescType::Interface,
        interface_number: number,
        alternate_setting: 0,
        num_endpoints: endpoints,
        interface_class: class[0],
        interface_subclass: class[1],
        interface_protocol: class[2],
        interface_s: 0,
    }
}

static DEVICE_DESCRIPTOR: UsbDeviceDescriptor = UsbDeviceDescriptor {
    length: core::mem::size_of::<UsbDeviceDescriptor>() as u8,
    descriptor_type: UsbDescType::Device,
    bcd_usb: le16(0x0200),
    // Miscellaneous / common class / IAD: functions are described by
    // interface association descriptors.
    device_class: 0xEF,
    device_subclass: 0x02,
    device_protocol: 0x01,
    max_packet_size0: MAX_PACKET as u8,
    vendor: le16(0),
    product: le16(1),
    bcd_device: le16(0x0100),
    manufacturer_s: 1,
    product_s: 2,
    serial_s: 0,
    num_configurations: 1,
};

static LANG_DESCRIPTOR: &[u8] = &[4, UsbDescType::String as u8, 0x09, 0x04];

static CONFIGURATION: CompositeConfiguration = CompositeConfiguration {
    config: UsbConfigurationDescriptor {
        length: core::mem::size_of::<UsbConfigurationDescriptor>() as u8,
        descriptor_type: UsbDescType::Config,
        total_length: le16(core::mem::size_of::<CompositeConfiguration>() as u16),
        num_interfaces: 3,
        configuration_value: 1,
        configuration_s: 0,
        attributes: 0x80,
        max_power: 50,
    },
    association: UsbInterfaceAssociationDescriptor {
        length: core::mem::size_of::<UsbInterfaceAssociationDescriptor>() as u8,
        descriptor_type: UsbDescType::InterfaceAssociation,
        first_interface: CDC_COMM_INTERFACE,
        interface_count: 2,
        function_class: 0x02,
        function_subclass: 0x02,
        function_protocol: 0x00,
        function_s: 0,
    },
    cdc_comm: interface_descriptor(CDC_COMM_INTERFACE, 1, [0x02, 0x02, 0x00]),
    cdc_header: CdcHeaderDescriptor {
        length: core::mem::size_of::<CdcHeaderDescriptor>() as u8,
        descriptor_type: UsbDescType::CsInterface,
        subtype: 0x00,
        bcd_cdc: le16(0x0110),
    },
    cdc_call_management: CdcCallManagementDescriptor {
        length: core::mem::size_of::<CdcCallManagementDescriptor>() as u8,
        descriptor_type: UsbDescType::CsInterface,
        subtype: 0x01,
        capabilities: 0x00,
        data_interface: CDC_DATA_INTERFACE,
    },
    cdc_acm: CdcAcmDescriptor {
        length: core::mem::size_of::<CdcAcmDescriptor>() as u8,
        descriptor_type: UsbDescType::CsInterface,
        subtype: 0x02,
        // SET/GET_LINE_CODING and SET_CONTROL_LINE_STATE.
        capabilities: 0x02,
    },
    cdc_union: CdcUnionDescriptor {
        length: core::mem::size_of::<CdcUnionDescriptor>() as u8,
        descriptor_type: UsbDescType::CsInterface,
        subtype: 0x06,
        control_interface: CDC_COMM_INTERFACE,
        subordinate_interface: CDC_DATA_INTERFACE,
    },
    cdc_notify: endpoint_descriptor(NOTIFY_ADDR, UsbTransferType::Interrupt, 16),
    cdc_data: interface_descriptor(CDC_DATA_INTERFACE, 2, [0x0A, 0x00, 0x00]),
    cdc_out: endpoint_descriptor(CDC_OUT_ADDR, UsbTransferType::Bulk, 0),
    cdc_in: endpoint_descriptor(CDC_IN_ADDR, UsbTransferType::Bulk, 0),
    // Mass storage, SCSI transparent command set, bulk-only transport.
    msc: interface_descriptor(MSC_INTERFACE, 2, [0x08, 0x06, 0x50]),
    msc_in: endpoint_descriptor(MSC_IN_ADDR, UsbTransferType::Bulk, 0),
    msc_out: endpoint_descriptor(MSC_OUT_ADDR, UsbTransferType::Bulk, 0),
};

/// Renders space-padded ASCII as a string descriptor in `out`.
fn string_descriptor<'a>(text: &[u8], out: &'a mut [u8; MAX_PACKET]) -> &'a [u8] {
    let end = text.iter().rposition(|&c| c != b' ').map_or(0, |i| i + 1);
    let text = &text[..end.min(MAX_PACKET / 2 - 1)];
    let len = 2 + 2 * text.len();
    out[0] = len as u8;
    out[1] = UsbDescType::String as u8;
    for (pair, &c) in out[2..len].chunks_exact_mut(2).zip(text) {
        pair[0] = c;
        pair[1] = 0;
    }
    &out[..len]
}

////////////////////////////////////////////////////////////////////////////
// USB structure and constant definitions.

/// Transfer direction, as found in the top bit of endpoint addresses and
/// `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum UsbDir {
    Out = 0,
    In = 0x80,
}

impl UsbDir {
    const fn endpoint(self, num: u8) -> u8 {
        num | self as u8
    }

    const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// Bits 6:5 of `bmRequestType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum UsbRequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

#[repr(C)]
#[derive(Debug, Default, AsBytes, FromBytes, Unaligned)]
struct UsbSetupPacket {
    request_type: u8,
    request: u8,
    value: U16<LittleEndian>,
    /// Interface number, for class requests.
    index: U16<LittleEndian>,
    /// Bytes in the data stage, or the most the host will take for an IN.
    length: U16<LittleEndian>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum UsbSetupRequest {
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetConfiguration = 0x09,
}

/// CDC PSTN requests handled by the communication interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
enum CdcRequest {
    SetLineCoding = 0x20,
    GetLineCoding = 0x21,
    SetControlLineState = 0x22,
}

/// Serial settings exchanged by the line-coding requests.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
struct LineCoding {
    dte_rate: U32<LittleEndian>,
    /// 0 = 1 stop bit.
    char_format: u8,
    /// 0 = none.
    parity: u8,
    data_bits: u8,
}

impl LineCoding {
    /// 115200 8N1.
    const DEFAULT: Self = Self {
        dte_rate: U32::from_bytes(115_200u32.to_le_bytes()),
        char_format: 0,
        parity: 0,
        data_bits: 8,
    };
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbDeviceDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    bcd_usb: U16<LittleEndian>,
    device_class: u8,
    device_subclass: u8,
    device_protocol: u8,
    max_packet_size0: u8,
    vendor: U16<LittleEndian>,
    product: U16<LittleEndian>,
    bcd_device: U16<LittleEndian>,
    manufacturer_s: u8,
    product_s: u8,
    serial_s: u8,
    num_configurations: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbConfigurationDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    /// Length of the whole bundle returned for GET_DESCRIPTOR(Config).
    total_length: U16<LittleEndian>,
    num_interfaces: u8,
    configuration_value: u8,
    configuration_s: u8,
    /// Bit 7 must be set; we are bus powered, no remote wakeup.
    attributes: u8,
    /// In units of 2 mA.
    max_power: u8,
}

/// Groups the two CDC interfaces into one function for the host.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbInterfaceAssociationDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    first_interface: u8,
    interface_count: u8,
    function_class: u8,
    function_subclass: u8,
    function_protocol: u8,
    function_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbInterfaceDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    interface_number: u8,
    alternate_setting: u8,
    num_endpoints: u8,
    interface_class: u8,
    interface_subclass: u8,
    interface_protocol: u8,
    interface_s: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct UsbEndpointDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    endpoint_address: u8,
    /// Bottom two bits: `UsbTransferType`.
    attributes: u8,
    max_packet_size: U16<LittleEndian>,
    /// Polling interval in ms, interrupt endpoints only.
    interval: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct CdcHeaderDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    subtype: u8,
    bcd_cdc: U16<LittleEndian>,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct CdcCallManagementDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    subtype: u8,
    capabilities: u8,
    data_interface: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct CdcAcmDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    subtype: u8,
    capabilities: u8,
}

#[repr(C)]
#[derive(Debug, AsBytes)]
struct CdcUnionDescriptor {
    length: u8,
    descriptor_type: UsbDescType,
    subtype: u8,
    control_interface: u8,
    subordinate_interface: u8,
}

/// Everything GET_DESCRIPTOR(Config) returns, in order.
#[repr(C)]
#[derive(Debug, AsBytes)]
struct CompositeConfiguration {
    config: UsbConfigurationDescriptor,
    association: UsbInterfaceAssociationDescriptor,
    cdc_comm: UsbInterfaceDescriptor,
    cdc_header: CdcHeaderDescriptor,
    cdc_call_management: CdcCallManagementDescriptor,
    cdc_acm: CdcAcmDescriptor,
    cdc_union: CdcUnionDescriptor,
    cdc_notify: UsbEndpointDescriptor,
    cdc_data: UsbInterfaceDescriptor,
    cdc_out: UsbEndpointDescriptor,
    cdc_in: UsbEndpointDescriptor,
    msc: UsbInterfaceDescriptor,
    msc_in: UsbEndpointDescriptor,
    msc_out: UsbEndpointDescriptor,
}

const _: () = assert!(core::mem::size_of::<CompositeConfiguration>() == 98);

#[derive(Copy, Clone, Debug, FromPrimitive, AsBytes)]
#[repr(u8)]
enum UsbDescType {
    Device = 0x01,
    Config = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    InterfaceAssociation = 0x0B,
    CsInterface = 0x24,
}

#[derive(Copy, Clone, Debug, FromPrimitive, AsBytes)]
#[repr(u8)]
enum UsbTransferType {
    Control = 0,
    Bulk = 2,
    Interrupt = 3,
}

////////////////////////////////////////////////////////////////////////////
// RP2040 support.

/// The pin must already be an SIO output.
#[inline(always)]
fn raise_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_set.write(|w| unsafe { w.bits(1 << pin) });
}

#[inline(always)]
fn lower_pin(sio: &rp2040_pac::SIO, pin: u8) {
    sio.gpio_out_clr.write(|w| unsafe { w.bits(1 << pin) });
}

// Second-stage bootloader for the board's QSPI flash, placed at the start of
// flash by memory.x.
cfg_if::cfg_if! {
    if #[cfg(feature = "target-feather")] {
        #[link_section = ".boot_loader"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_GD25Q64CS;
    } else {
        #[link_section = ".boot_loader"]
        #[used]
        static BOOT2: [u8; 256] = rp2040_boot2::BOOT_LOADER_W25Q080;
    }
}
