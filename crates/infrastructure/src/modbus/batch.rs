use super::config::{RegisterConfig, RegisterType};

/// Per Modbus spec, one read may span at most 125 registers.
const MAX_BLOCK_SPAN: u16 = 125;
/// Registers this close together are read in one request and split.
const MAX_GAP: u16 = 2;

/// A contiguous read covering one or more configured registers.
#[derive(Debug, Clone)]
pub struct ReadBlock {
    pub register_type: RegisterType,
    pub start: u16,
    pub count: u16,
    /// The registers served by this block, with their original config.
    pub registers: Vec<RegisterConfig>,
}

impl ReadBlock {
    /// Slice this block's response words for one member register.
    pub fn slice<'a>(&self, words: &'a [u16], register: &RegisterConfig) -> Option<&'a [u16]> {
        let offset = register.address.checked_sub(self.start)? as usize;
        let span = register.span() as usize;
        words.get(offset..offset + span)
    }
}

/// Group registers per function code and merge near-contiguous addresses
/// (gap <= 2) into single reads bounded by the Modbus 125-register limit.
pub fn plan_blocks(registers: &[RegisterConfig]) -> Vec<ReadBlock> {
    let mut blocks: Vec<ReadBlock> = Vec::new();

    for register_type in [
        RegisterType::Holding,
        RegisterType::Input,
        RegisterType::Coil,
        RegisterType::Discrete,
    ] {
        let mut group: Vec<RegisterConfig> = registers
            .iter()
            .filter(|r| r.register_type == register_type)
            .cloned()
            .collect();
        if group.is_empty() {
            continue;
        }
        group.sort_by_key(|r| r.address);

        let mut current: Option<ReadBlock> = None;
        for register in group {
            let span = register.span();
            let end = register.address + span;

            match current.as_mut() {
                Some(block) => {
                    let block_end = block.start + block.count;
                    let gap = register.address.saturating_sub(block_end);
                    let new_span = end.saturating_sub(block.start);

                    if register.address >= block_end
                        && gap <= MAX_GAP
                        && new_span <= MAX_BLOCK_SPAN
                    {
                        block.count = new_span;
                        block.registers.push(register);
                    } else if register.address < block_end {
                        // Overlapping or duplicate address: widen if needed.
                        if end > block_end && new_span <= MAX_BLOCK_SPAN {
                            block.count = new_span;
                        }
                        block.registers.push(register);
                    } else {
                        blocks.push(current.take().expect("block present"));
                        current = Some(ReadBlock {
                            register_type,
                            start: register.address,
                            count: span,
                            registers: vec![register],
                        });
                    }
                }
                None => {
                    current = Some(ReadBlock {
                        register_type,
                        start: register.address,
                        count: span,
                        registers: vec![register],
                    });
                }
            }
        }
        if let Some(block) = current {
            blocks.push(block);
        }
    }

    blocks
}
