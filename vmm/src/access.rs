//! The memory access pipeline.
//!
//! Reads run in stages: cache phase, speculative readahead, batched device
//! read, statistics and zero-fill fixups, cache insert. Virtual reads and
//! writes translate to a dense physical sub-batch through the memory model,
//! consulting the paged-memory decoder for full-page reads when translation
//! fails. Byte-granular wrappers split a range into page descriptors; the
//! middle pages transfer directly against the caller's buffer, the partial
//! first and last pages go through scratch pages.

use core::sync::atomic::Ordering;

use crate::cache::{CacheTable, CacheTag, PageRef};
use crate::error::{VmmError, VmmResult};
use crate::model::{PagedRead, VirtToPhys};
use crate::process::Process;
use crate::scatter::{page_base, page_offset, MemScatter, VmmFlags, ADDR_INVALID, PAGE_SIZE};
use crate::Vmm;

/// Upper bound on in-flight descriptors per speculative batch.
const SPECULATIVE_MAX: usize = 0x18;

/// TLB prefetch round size, bounding cache bleed per batch.
const TLB_PREFETCH_ROUND: usize = 0x2000;

// Pipeline-stage discriminators kept on the descriptor stack through the
// device read.
const DISC_NORMAL: u64 = 1;
const DISC_CACHE_HIT: u64 = 2;
const DISC_DONE: u64 = 3;

impl Vmm {
    pub(crate) fn cache_table(&self, tag: CacheTag) -> &CacheTable {
        match tag {
            CacheTag::Phys => &self.cache_phys,
            CacheTag::Tlb => &self.cache_tlb,
            CacheTag::Paging => &self.cache_paging,
        }
    }

    pub(crate) fn device_pa_max(&self) -> u64 {
        self.device.pa_max()
    }

    /// True if the page at `addr` is present in the given cache tier.
    pub fn cache_exists(&self, tag: CacheTag, addr: u64) -> bool {
        self.cache_table(tag).exists(addr)
    }

    /// Drop every cached entry of one tier. Clearing the TLB tier also
    /// resets the per-process spider flags.
    pub fn cache_clear(&self, tag: CacheTag) {
        self.cache_table(tag).clear();
        if tag == CacheTag::Tlb {
            self.process_tlb_spider_clear();
        }
    }

    /// Invalidate one physical page in the TLB and PHYS tiers.
    pub fn cache_invalidate(&self, pa: u64) {
        let pa = page_base(pa);
        self.cache_tlb.invalidate(pa);
        self.cache_phys.invalidate(pa);
    }

    /// Look up `addr` in `primary`; on miss, promote a hit from `secondary`
    /// or fetch the page from the device, publishing the result in
    /// `primary`.
    pub(crate) fn cache_get_from_device_on_miss(
        &self,
        primary: CacheTag,
        secondary: Option<CacheTag>,
        addr: u64,
    ) -> Option<PageRef<'_>> {
        let table = self.cache_table(primary);
        if let Some(page) = table.get(addr) {
            return Some(page);
        }
        let mut reserve = table.reserve()?;
        reserve.set_addr(addr);
        if let Some(secondary) = secondary {
            if let Some(hit) = self.cache_table(secondary).get(addr) {
                reserve.data_mut().copy_from_slice(hit.data());
                reserve.set_valid(true);
            }
        }
        if !reserve.valid() {
            let valid = {
                let mut mem = MemScatter::new(addr, reserve.data_mut());
                self.device.read_scatter(&mut [&mut mem]);
                mem.valid
            };
            reserve.set_valid(valid);
        }
        table.reserve_return_acquire(reserve)
    }

    /// Fetch a page-table page through the TLB cache, with the PHYS cache as
    /// promotion source. Fresh reads are verified by the memory model; a
    /// candidate failing verification stays cached but is not returned.
    pub fn tlb_page_table(&self, pa: u64, cache_only: bool) -> Option<PageRef<'_>> {
        if let Some(page) = self.cache_tlb.get(pa) {
            self.stats.tlb_cache_hit.fetch_add(1, Ordering::Relaxed);
            return Some(page);
        }
        if cache_only {
            return None;
        }
        let Some(page) =
            self.cache_get_from_device_on_miss(CacheTag::Tlb, Some(CacheTag::Phys), pa)
        else {
            self.stats.tlb_read_fail.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.stats.tlb_read_success.fetch_add(1, Ordering::Relaxed);
        if self.model.page_table_verify(self, page.data(), pa, false) {
            return Some(page);
        }
        None
    }

    /// Translate a virtual address for `process`.
    pub fn virt_to_phys(&self, process: &Process, va: u64) -> Option<u64> {
        match self.model.virt_to_phys(self, process, va) {
            VirtToPhys::Mapped(pa) => Some(pa),
            VirtToPhys::NotMapped { .. } => None,
        }
    }

    /// Physical scatter read.
    pub fn read_scatter_physical<'a>(
        &self,
        mems: &mut [&mut MemScatter<'a>],
        flags: VmmFlags,
    ) {
        let eff = flags | self.default_flags;
        let use_cache = !eff.contains(VmmFlags::NOCACHE);
        let zeropad = eff.contains(VmmFlags::ZEROPAD_ON_FAIL);
        let mut n_done = 0usize;
        let mut n_miss = 0usize;
        let mut last_miss = 0u64;
        // 1: cache phase
        if use_cache {
            for mem in mems.iter_mut() {
                if mem.valid {
                    mem.push(DISC_DONE);
                    n_done += 1;
                    continue;
                }
                if mem.is_full_page() {
                    if let Some(page) = self.cache_phys.get(mem.addr) {
                        mem.buf_mut().copy_from_slice(page.data());
                        mem.valid = true;
                        mem.push(DISC_CACHE_HIT);
                        self.stats.phys_cache_hit.fetch_add(1, Ordering::Relaxed);
                        n_done += 1;
                        continue;
                    }
                }
                mem.push(DISC_NORMAL);
                if n_miss < SPECULATIVE_MAX {
                    last_miss = mem.addr;
                }
                n_miss += 1;
            }
            if n_done == mems.len() || flags.contains(VmmFlags::FORCECACHE_READ) {
                for mem in mems.iter_mut() {
                    mem.pop();
                }
                return;
            }
        }
        // 2: speculative readahead when the miss set is small; the
        // fabricated descriptors ride along on the same device batch,
        // addressing the pages after the last miss
        let speculate = use_cache && n_miss > 0 && n_miss < SPECULATIVE_MAX;
        let mut spec_resv = Vec::new();
        let mut spec_mems: Vec<MemScatter<'a>> = Vec::new();
        if speculate {
            for mem in mems.iter_mut() {
                if mem.valid {
                    mem.pop();
                }
            }
            let mut next = page_base(last_miss);
            while n_miss + spec_mems.len() < SPECULATIVE_MAX {
                let Some(reserve) = self.cache_phys.reserve() else {
                    break;
                };
                next = next.wrapping_add(PAGE_SIZE as u64);
                spec_mems.push(MemScatter::new_owned(next));
                spec_resv.push(reserve);
            }
        }
        // 3: device read over one combined batch
        {
            let mut batch: Vec<&mut MemScatter<'a>> =
                Vec::with_capacity(mems.len() + spec_mems.len());
            if speculate {
                for mem in mems.iter_mut() {
                    if !mem.valid {
                        batch.push(&mut **mem);
                    }
                }
            } else {
                for mem in mems.iter_mut() {
                    batch.push(&mut **mem);
                }
            }
            batch.extend(spec_mems.iter_mut());
            self.device.read_scatter(&mut batch);
        }
        // 4: statistics and zero-fill fixups
        let pa_max = self.device.pa_max();
        let account = |mem: &mut MemScatter<'_>| {
            if mem.valid {
                self.stats.phys_read_success.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.phys_read_fail.fetch_add(1, Ordering::Relaxed);
                if zeropad && mem.addr < pa_max {
                    mem.buf_mut().fill(0);
                    mem.valid = true;
                }
            }
        };
        if speculate {
            for mem in mems.iter_mut() {
                if mem.stack_len() > 0 {
                    account(&mut **mem);
                }
            }
        } else {
            for mem in mems.iter_mut() {
                account(&mut **mem);
            }
        }
        for mem in spec_mems.iter_mut() {
            account(mem);
        }
        // 5: cache insert
        if use_cache {
            let put = !eff.contains(VmmFlags::NOCACHEPUT);
            for mem in mems.iter_mut() {
                if mem.stack_len() == 0 {
                    continue;
                }
                let disc = mem.pop();
                if put && disc == DISC_NORMAL && mem.valid && mem.is_full_page() {
                    if let Some(mut reserve) = self.cache_phys.reserve() {
                        reserve.set_addr(mem.addr);
                        reserve.data_mut().copy_from_slice(mem.buf());
                        reserve.set_valid(true);
                        self.cache_phys.reserve_return(reserve);
                    }
                }
            }
            for (mut reserve, mem) in spec_resv.into_iter().zip(spec_mems.iter()) {
                if !put {
                    continue; // dropping the reservation recycles it
                }
                if mem.valid {
                    reserve.set_addr(mem.addr);
                    reserve.data_mut().copy_from_slice(mem.buf());
                    reserve.set_valid(true);
                }
                self.cache_phys.reserve_return(reserve);
            }
        }
    }

    /// Virtual scatter read for `process`.
    pub fn read_scatter_virtual<'a>(
        &self,
        process: &Process,
        mems: &mut [&mut MemScatter<'a>],
        flags: VmmFlags,
    ) {
        let eff = flags | self.default_flags;
        let paging = !eff.contains(VmmFlags::NOPAGING);
        let alt_pte = flags.contains(VmmFlags::ALTADDR_VA_PTE);
        let zeropad = eff.contains(VmmFlags::ZEROPAD_ON_FAIL);
        let mut targets: Vec<(usize, u64)> = Vec::new();
        for (i, mem) in mems.iter_mut().enumerate() {
            if mem.valid || mem.addr == 0 || mem.addr == ADDR_INVALID {
                if !mem.valid && zeropad {
                    mem.buf_mut().fill(0);
                }
                continue;
            }
            let va = mem.addr;
            let mut pa = None;
            let mut pte = 0u64;
            if !alt_pte {
                match self.model.virt_to_phys(self, process, va) {
                    VirtToPhys::Mapped(p) => pa = Some(p),
                    VirtToPhys::NotMapped { pte: e } => pte = e,
                }
            }
            if pa.is_none() && paging && mem.is_full_page() {
                let (paged_va, paged_pte) = if alt_pte { (0, va) } else { (va, pte) };
                match self
                    .model
                    .paged_read(self, process, paged_va, paged_pte, Some(mem.buf_mut()), eff)
                {
                    PagedRead::Direct => {
                        mem.valid = true;
                        continue;
                    }
                    PagedRead::Redirect(p) => pa = Some(p),
                    PagedRead::Fail => {}
                }
            }
            match pa {
                Some(pa) => targets.push((i, pa)),
                None => {
                    if zeropad {
                        mem.buf_mut().fill(0);
                    }
                }
            }
        }
        if targets.is_empty() {
            return;
        }
        // Dense physical sub-batch aliasing the virtual buffers; the origin
        // index array stands in for per-descriptor back pointers.
        let mut phys: Vec<MemScatter<'a>> = Vec::with_capacity(targets.len());
        for &(i, pa) in &targets {
            phys.push(MemScatter::from_parts(pa, mems[i].take_buf()));
        }
        {
            let mut refs: Vec<&mut MemScatter<'a>> = phys.iter_mut().collect();
            self.read_scatter_physical(&mut refs, flags);
        }
        for (task, &(i, _)) in phys.into_iter().zip(&targets) {
            mems[i].valid = task.valid;
            let buf = task.into_buf();
            mems[i].restore_buf(buf);
        }
    }

    /// Physical scatter write. Written pages are invalidated in the TLB and
    /// PHYS tiers after the device reports success.
    pub fn write_scatter_physical(&self, mems: &mut [&mut MemScatter<'_>]) {
        self.device.write_scatter(mems);
        for mem in mems.iter() {
            self.stats.phys_write.fetch_add(1, Ordering::Relaxed);
            if mem.valid && mem.addr != ADDR_INVALID {
                self.cache_invalidate(mem.addr);
            }
        }
    }

    /// Virtual scatter write for `process`. Original addresses are saved on
    /// the descriptor stack and restored after the physical write.
    pub fn write_scatter_virtual(&self, process: &Process, mems: &mut [&mut MemScatter<'_>]) {
        for mem in mems.iter_mut() {
            let va = mem.addr;
            mem.push(va);
            if mem.valid || va == ADDR_INVALID {
                mem.addr = ADDR_INVALID;
                continue;
            }
            match self.model.virt_to_phys(self, process, va) {
                VirtToPhys::Mapped(pa) => mem.addr = pa,
                VirtToPhys::NotMapped { pte } => {
                    // The decoder can still yield a writable physical
                    // location for some paged-out forms.
                    let redirect = match self.model.paged_read(
                        self,
                        process,
                        va,
                        pte,
                        None,
                        VmmFlags::empty(),
                    ) {
                        PagedRead::Redirect(pa) => Some(pa),
                        _ => None,
                    };
                    mem.addr = redirect.unwrap_or(ADDR_INVALID);
                }
            }
        }
        self.write_scatter_physical(mems);
        for mem in mems.iter_mut() {
            mem.addr = mem.pop();
        }
    }

    /// Byte-granular read. Failed slices are zero-filled; the return value
    /// counts successfully read bytes.
    pub fn read_ex(
        &self,
        process: Option<&Process>,
        addr: u64,
        buf: &mut [u8],
        flags: VmmFlags,
    ) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let cb = buf.len();
        let o_first = page_offset(addr);
        let n_pages = (o_first + cb + PAGE_SIZE - 1) / PAGE_SIZE;
        let base = page_base(addr);
        let cb_first = core::cmp::min(cb, PAGE_SIZE - o_first);
        let o_end = page_offset(addr.wrapping_add(cb as u64));
        let cb_last = if o_end == 0 { PAGE_SIZE } else { o_end };
        let mut first_page = [0u8; PAGE_SIZE];
        let mut last_page = [0u8; PAGE_SIZE];
        let valids: Vec<bool>;
        {
            let mut descs: Vec<MemScatter<'_>> = Vec::with_capacity(n_pages);
            descs.push(MemScatter::new(base, &mut first_page));
            if n_pages > 1 {
                let mid = &mut buf[cb_first..];
                for (k, chunk) in mid
                    .chunks_exact_mut(PAGE_SIZE)
                    .take(n_pages - 2)
                    .enumerate()
                {
                    descs.push(MemScatter::new(base + ((k as u64 + 1) << 12), chunk));
                }
                descs.push(MemScatter::new(
                    base + ((n_pages as u64 - 1) << 12),
                    &mut last_page,
                ));
            }
            {
                let mut refs: Vec<&mut MemScatter<'_>> = descs.iter_mut().collect();
                match process {
                    Some(p) => self.read_scatter_virtual(p, &mut refs, flags),
                    None => self.read_scatter_physical(&mut refs, flags),
                }
            }
            // failed middle pages turn into zeroes in place
            for d in descs.iter_mut().skip(1).take(n_pages.saturating_sub(2)) {
                if !d.valid {
                    d.buf_mut().fill(0);
                }
            }
            valids = descs.iter().map(|d| d.valid).collect();
        }
        let mut read = 0usize;
        for &ok in valids.iter().take(n_pages.saturating_sub(1)).skip(1) {
            if ok {
                read += PAGE_SIZE;
            }
        }
        if valids[0] {
            buf[..cb_first].copy_from_slice(&first_page[o_first..o_first + cb_first]);
            read += cb_first;
        } else {
            buf[..cb_first].fill(0);
        }
        if n_pages > 1 {
            let tail = cb - cb_last;
            if valids[n_pages - 1] {
                buf[tail..].copy_from_slice(&last_page[..cb_last]);
                read += cb_last;
            } else {
                buf[tail..].fill(0);
            }
        }
        read
    }

    /// Read exactly `buf.len()` bytes at `addr`.
    pub fn read(&self, process: Option<&Process>, addr: u64, buf: &mut [u8]) -> VmmResult<()> {
        let read = self.read_ex(process, addr, buf, VmmFlags::empty());
        if read == buf.len() {
            Ok(())
        } else {
            Err(VmmError::PartialRead {
                read,
                requested: buf.len(),
            })
        }
    }

    /// Allocate-and-read convenience; `None` unless every byte was read.
    pub fn read_vec(
        &self,
        process: Option<&Process>,
        addr: u64,
        cb: usize,
        flags: VmmFlags,
    ) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; cb];
        if self.read_ex(process, addr, &mut buf, flags) == cb {
            Some(buf)
        } else {
            None
        }
    }

    /// Read one whole page.
    pub fn read_page(
        &self,
        process: Option<&Process>,
        addr: u64,
        page: &mut [u8; PAGE_SIZE],
    ) -> bool {
        self.read_ex(process, addr, page, VmmFlags::empty()) == PAGE_SIZE
    }

    /// Byte-granular write. Returns the number of bytes written.
    pub fn write_ex(&self, process: Option<&Process>, addr: u64, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut scratch = data.to_vec();
        let cb_first = core::cmp::min(data.len(), PAGE_SIZE - page_offset(addr));
        let mut descs: Vec<MemScatter<'_>> = Vec::new();
        let (first, rest) = scratch.split_at_mut(cb_first);
        descs.push(MemScatter::new(addr, first));
        let mut chunk_addr = addr + cb_first as u64;
        for chunk in rest.chunks_mut(PAGE_SIZE) {
            let len = chunk.len() as u64;
            descs.push(MemScatter::new(chunk_addr, chunk));
            chunk_addr += len;
        }
        {
            let mut refs: Vec<&mut MemScatter<'_>> = descs.iter_mut().collect();
            match process {
                Some(p) => self.write_scatter_virtual(p, &mut refs),
                None => self.write_scatter_physical(&mut refs),
            }
        }
        descs.iter().filter(|d| d.valid).map(|d| d.len()).sum()
    }

    /// Write exactly `data.len()` bytes at `addr`.
    pub fn write(&self, process: Option<&Process>, addr: u64, data: &[u8]) -> VmmResult<()> {
        let written = self.write_ex(process, addr, data);
        if written == data.len() {
            Ok(())
        } else {
            Err(VmmError::PartialWrite {
                written,
                requested: data.len(),
            })
        }
    }

    /// File-like read over an object spanning `[mem_addr, mem_addr +
    /// mem_size)`. Clamps to the object and distinguishes end-of-file from
    /// success; short tails are zero-padded rather than failed.
    pub fn read_as_file(
        &self,
        process: Option<&Process>,
        mem_addr: u64,
        mem_size: u64,
        buf: &mut [u8],
        offset: u64,
    ) -> VmmResult<usize> {
        if mem_size <= offset {
            return Err(VmmError::EndOfFile);
        }
        let avail = mem_size - offset;
        let n = core::cmp::min(buf.len() as u64, avail) as usize;
        if n == 0 {
            return Err(VmmError::EndOfFile);
        }
        self.read_ex(
            process,
            mem_addr + offset,
            &mut buf[..n],
            VmmFlags::ZEROPAD_ON_FAIL,
        );
        Ok(n)
    }

    /// File-like write counterpart of [`Vmm::read_as_file`].
    pub fn write_as_file(
        &self,
        process: Option<&Process>,
        mem_addr: u64,
        mem_size: u64,
        data: &[u8],
        offset: u64,
    ) -> VmmResult<usize> {
        if mem_size <= offset {
            return Err(VmmError::EndOfFile);
        }
        let avail = mem_size - offset;
        let n = core::cmp::min(data.len() as u64, avail) as usize;
        if n == 0 {
            return Err(VmmError::EndOfFile);
        }
        self.write_ex(process, mem_addr + offset, &data[..n]);
        Ok(n)
    }

    /// Prefetch verified page-table pages into the TLB tier, in bounded
    /// rounds.
    pub fn tlb_prefetch(&self, pas: &[u64]) {
        for round in pas.chunks(TLB_PREFETCH_ROUND) {
            let mut reserves = Vec::with_capacity(round.len());
            for &pa in round {
                let Some(mut reserve) = self.cache_tlb.reserve() else {
                    break;
                };
                reserve.set_addr(page_base(pa));
                reserves.push(reserve);
            }
            let outcomes: Vec<bool> = {
                let mut mems: Vec<MemScatter<'_>> = reserves
                    .iter_mut()
                    .map(|r| {
                        let addr = r.addr();
                        MemScatter::new(addr, r.data_mut())
                    })
                    .collect();
                {
                    let mut refs: Vec<&mut MemScatter<'_>> = mems.iter_mut().collect();
                    self.device.read_scatter(&mut refs);
                }
                mems.iter()
                    .map(|m| {
                        m.valid && self.model.page_table_verify(self, m.buf(), m.addr, false)
                    })
                    .collect()
            };
            for (mut reserve, ok) in reserves.into_iter().zip(outcomes) {
                reserve.set_valid(ok);
                self.cache_tlb.reserve_return(reserve);
            }
        }
    }

    /// Prefetch a set of pages into the cache tier. Useful ahead of sparse
    /// reads over higher-latency transports.
    pub fn prefetch_pages(&self, process: Option<&Process>, addrs: &[u64], flags: VmmFlags) {
        let mut pages: Vec<u64> = addrs
            .iter()
            .map(|&a| page_base(a))
            .filter(|&a| a != 0 && a != page_base(ADDR_INVALID))
            .collect();
        pages.sort_unstable();
        pages.dedup();
        if pages.is_empty() {
            return;
        }
        let mut backing = vec![0u8; pages.len() * PAGE_SIZE];
        let mut mems: Vec<MemScatter<'_>> = backing
            .chunks_exact_mut(PAGE_SIZE)
            .zip(&pages)
            .map(|(chunk, &addr)| MemScatter::new(addr, chunk))
            .collect();
        let mut refs: Vec<&mut MemScatter<'_>> = mems.iter_mut().collect();
        match process {
            Some(p) => self.read_scatter_virtual(p, &mut refs, flags),
            None => self.read_scatter_physical(&mut refs, flags),
        }
    }

    /// Prefetch every page touched by the given byte ranges.
    pub fn prefetch_ranges(
        &self,
        process: Option<&Process>,
        ranges: &[(u64, usize)],
        flags: VmmFlags,
    ) {
        let mut addrs = Vec::new();
        for &(addr, len) in ranges {
            if len == 0 {
                continue;
            }
            let mut page = page_base(addr);
            let end = addr.saturating_add(len as u64);
            while page < end {
                addrs.push(page);
                match page.checked_add(PAGE_SIZE as u64) {
                    Some(next) => page = next,
                    None => break,
                }
            }
        }
        self.prefetch_pages(process, &addrs, flags);
    }
}
