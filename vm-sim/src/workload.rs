//! Paging workloads run against a [`Vm`]

use crate::host_file::HostFile;
use demand_vm::{PageInit, Space, VirtAddr, Vm, VmType, PAGE_SIZE};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Where workload pages are placed in the simulated address space
const DATA_BASE: usize = 0x1000_0000;
/// Where the file mapping of the mmap workload starts
const MMAP_BASE: usize = 0x2000_0000;

fn vm_err(err: demand_vm::VmError) -> io::Error {
    io::Error::other(err)
}

fn page_addr(i: usize) -> VirtAddr {
    VirtAddr(DATA_BASE + i * PAGE_SIZE)
}

fn random_page(rng: &mut impl Rng) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    rng.fill(&mut page[..]);
    page
}

/// Register `pages` anonymous pages and fill each with random bytes
fn fill(space: &Space, pages: usize, rng: &mut impl Rng) -> io::Result<Vec<Vec<u8>>> {
    let mut expected = Vec::with_capacity(pages);
    for i in 0..pages {
        space
            .allocate(VmType::Anon, page_addr(i), true, PageInit::Zero)
            .map_err(vm_err)?;
        let data = random_page(rng);
        space.write(page_addr(i), &data).map_err(vm_err)?;
        expected.push(data);
    }
    Ok(expected)
}

fn verify(space: &Space, i: usize, expected: &[u8], who: &str) -> io::Result<()> {
    let mut page = vec![0u8; PAGE_SIZE];
    space.read(page_addr(i), &mut page).map_err(vm_err)?;
    if page != expected {
        return Err(io::Error::other(format!("{who} page {i} lost its content")));
    }
    Ok(())
}

/// Write `pages` anonymous pages, then reread and rewrite them in random order
pub fn anon(vm: &Arc<Vm>, pages: usize, rounds: usize, rng: &mut impl Rng) -> io::Result<()> {
    let space = vm.create_space();
    let mut expected = fill(&space, pages, rng)?;
    let mut order: Vec<usize> = (0..pages).collect();
    for round in 0..rounds {
        order.shuffle(rng);
        for &i in &order {
            verify(&space, i, &expected[i], "anon")?;
            expected[i] = random_page(rng);
            space.write(page_addr(i), &expected[i]).map_err(vm_err)?;
        }
        log::info!("anon: round {round} verified {pages} page(s)");
    }
    vm.audit().map_err(vm_err)
}

/// Fill `pages` pages, fork, overwrite them in the child and check the parent is untouched
pub fn fork(vm: &Arc<Vm>, pages: usize, rng: &mut impl Rng) -> io::Result<()> {
    let parent = vm.create_space();
    let before = fill(&parent, pages, rng)?;
    let child = parent.fork().map_err(vm_err)?;
    let mut after = Vec::with_capacity(pages);
    for i in 0..pages {
        let data = random_page(rng);
        child.write(page_addr(i), &data).map_err(vm_err)?;
        after.push(data);
    }
    for i in 0..pages {
        verify(&parent, i, &before[i], "parent")?;
        verify(&child, i, &after[i], "child")?;
    }
    vm.audit().map_err(vm_err)?;
    drop(child);
    drop(parent);
    Ok(())
}

/// Map a host file, rewrite it through the mapping, force eviction, unmap, and compare
pub fn mmap(vm: &Arc<Vm>, path: &Path, rng: &mut impl Rng) -> io::Result<()> {
    let host = OpenOptions::new().read(true).write(true).open(path)?;
    let len = usize::try_from(host.metadata()?.len()).map_err(io::Error::other)?;
    let file = HostFile::new(host);
    let space = vm.create_space();
    let base = VirtAddr(MMAP_BASE);
    space.mmap(base, len, true, &file, 0).map_err(vm_err)?;

    let mut expected = vec![0u8; len];
    rng.fill(&mut expected[..]);
    space.write(base, &expected).map_err(vm_err)?;

    let churn = vm.config().user_frames * 2;
    fill(&space, churn, rng)?;
    log::info!("mmap: {} eviction(s) after churn", vm.stats().evictions);

    space.munmap(base);
    vm.audit().map_err(vm_err)?;
    drop(space);

    if fs::read(path)? != expected {
        return Err(io::Error::other("host file does not match the mapping"));
    }
    Ok(())
}
