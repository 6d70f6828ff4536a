// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::boot::AppVectors;
use cortex_m::peripheral::SCB;

/// Relocates the vector table and branches to the application.
///
/// # Safety
///
/// `vectors` must come from a validated vector table located at
/// `vector_table`. Peripherals and interrupts used by the bootloader must be
/// disabled beforehand, since the application starts with the current
/// peripheral state.
pub unsafe fn jump_to_app(vector_table: u32, vectors: AppVectors) -> ! {
    cortex_m::interrupt::disable();

    (*SCB::PTR).vtor.write(vector_table);
    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    cortex_m::asm::bootstrap(vectors.stack_pointer as *const u32, vectors.reset_vector as *const u32)
}
