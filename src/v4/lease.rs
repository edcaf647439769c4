//! Address pool and lease table.
//!
//! Addresses move through three states: *available* (never handed out, in
//! the fresh queue), *leased* (held by a record with time left or an
//! infinite lifetime) and *reclaimable* (record at zero seconds, owner queued
//! in the reclaim queue). An address is in exactly one of them at a time.

use super::message::ClientId;
use crate::error::HarborError;
use std::{
    collections::{HashMap, VecDeque},
    net::Ipv4Addr,
};

/// Time left on a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Seconds(u32),
    /// Permanent reservation: never decremented, never expires.
    Infinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRecord {
    pub address: Ipv4Addr,
    pub remaining: Remaining,
}

/// Who a lease record belongs to. The server's own address is held by
/// `Server`, which no hardware address can collide with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseHolder {
    Server,
    Client(ClientId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Assigned(Ipv4Addr),
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    Ack(Ipv4Addr),
    Nack,
}

#[derive(Debug)]
pub struct LeaseTable {
    first: Ipv4Addr,
    last: Ipv4Addr,
    lease_duration: u32,
    records: HashMap<LeaseHolder, LeaseRecord>,
    available: VecDeque<Ipv4Addr>,
    reclaim: VecDeque<ClientId>,
}

impl LeaseTable {
    /// Builds the pool `[first, last]` minus `own_address`, and reserves
    /// `own_address` permanently for the server.
    pub fn initialize(
        first: Ipv4Addr,
        last: Ipv4Addr,
        own_address: Ipv4Addr,
        lease_duration: u32,
    ) -> Result<Self, HarborError> {
        if first >= last {
            return Err(HarborError::Config(format!(
                "invalid address range: {first} must be lower than {last}"
            )));
        }

        let available = (u32::from(first)..=u32::from(last))
            .map(Ipv4Addr::from)
            .filter(|addr| *addr != own_address)
            .collect::<VecDeque<_>>();
        tracing::debug!("Address pool holds {} addresses", available.len());

        let mut records = HashMap::new();
        records.insert(
            LeaseHolder::Server,
            LeaseRecord {
                address: own_address,
                remaining: Remaining::Infinite,
            },
        );

        Ok(Self {
            first,
            last,
            lease_duration,
            records,
            available,
            reclaim: VecDeque::new(),
        })
    }

    pub fn lookup(&self, client: &ClientId) -> Option<&LeaseRecord> {
        self.records.get(&LeaseHolder::Client(*client))
    }

    /// Finds an address for `client`: its existing one, a fresh one, or the
    /// address of the client whose lease expired first.
    pub fn allocate(&mut self, client: ClientId) -> Allocation {
        let holder = LeaseHolder::Client(client);

        if let Some(record) = self.records.get_mut(&holder) {
            if let Remaining::Seconds(secs) = record.remaining {
                if secs != 0 {
                    tracing::debug!(
                        "Client {client} sent DISCOVER while its lease is still active"
                    );
                }
                record.remaining = Remaining::Seconds(self.lease_duration);
            }
            let address = record.address;
            self.reclaim.retain(|queued| *queued != client);
            return Allocation::Assigned(address);
        }

        let address = if let Some(address) = self.available.pop_front() {
            address
        } else if let Some(oldest) = self.reclaim.pop_front() {
            match self.records.remove(&LeaseHolder::Client(oldest)) {
                Some(record) => {
                    tracing::info!(
                        "Reclaiming {} from expired client {oldest}",
                        record.address
                    );
                    record.address
                }
                None => return Allocation::Exhausted,
            }
        } else {
            return Allocation::Exhausted;
        };

        self.records.insert(
            holder,
            LeaseRecord {
                address,
                remaining: Remaining::Seconds(self.lease_duration),
            },
        );
        Allocation::Assigned(address)
    }

    /// Extends the lease of `client` by one lease duration.
    ///
    /// A client that asks for an address other than the one it holds is refused.
    pub fn renew(&mut self, client: ClientId, requested: Ipv4Addr) -> Renewal {
        let Some(record) = self.records.get_mut(&LeaseHolder::Client(client)) else {
            return Renewal::Nack;
        };
        if record.address != requested {
            return Renewal::Nack;
        }

        if let Remaining::Seconds(secs) = record.remaining {
            // Stay below the all-ones sentinel.
            let extended = secs.saturating_add(self.lease_duration).min(u32::MAX - 1);
            record.remaining = Remaining::Seconds(extended);
        }
        let address = record.address;
        self.reclaim.retain(|queued| *queued != client);
        Renewal::Ack(address)
    }

    /// Advances every finite lease by one second.
    pub fn tick(&mut self) {
        let mut expired = Vec::new();

        for (holder, record) in self.records.iter_mut() {
            let (LeaseHolder::Client(client), Remaining::Seconds(secs)) =
                (holder, record.remaining)
            else {
                continue;
            };
            if secs == 0 {
                continue;
            }
            record.remaining = Remaining::Seconds(secs - 1);
            if secs == 1 {
                expired.push((record.address, *client));
            }
        }

        // HashMap order is arbitrary; leases lapsing together queue by address.
        expired.sort();
        for (address, client) in expired {
            tracing::info!("Lease expired: chaddr {client}, address {address}");
            if !self.reclaim.contains(&client) {
                self.reclaim.push_back(client);
            }
        }
    }

    /// Permanently reserves `address` for `client`.
    pub fn add_static_entry(
        &mut self,
        client: ClientId,
        address: Ipv4Addr,
    ) -> Result<(), HarborError> {
        if !self.contains(address) {
            return Err(HarborError::OutOfRange {
                address,
                first: self.first,
                last: self.last,
            });
        }
        if let Some(record) = self.lookup(&client) {
            return Err(HarborError::Conflict(format!(
                "client {client} already holds {}",
                record.address
            )));
        }
        if let Some(holder) = self.holder_of(address) {
            return Err(HarborError::Conflict(format!(
                "address {address} is already assigned to {holder:?}"
            )));
        }

        self.available.retain(|free| *free != address);
        self.records.insert(
            LeaseHolder::Client(client),
            LeaseRecord {
                address,
                remaining: Remaining::Infinite,
            },
        );
        Ok(())
    }

    /// Whether `address` lies inside `[first, last]`.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        address >= self.first && address <= self.last
    }

    /// Number of never-assigned addresses left.
    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    /// Expired clients, oldest first.
    pub fn reclaim_queue(&self) -> impl Iterator<Item = &ClientId> {
        self.reclaim.iter()
    }

    pub fn records(&self) -> impl Iterator<Item = (&LeaseHolder, &LeaseRecord)> {
        self.records.iter()
    }

    fn holder_of(&self, address: Ipv4Addr) -> Option<LeaseHolder> {
        self.records
            .iter()
            .find(|(_, record)| record.address == address)
            .map(|(holder, _)| *holder)
    }
}
