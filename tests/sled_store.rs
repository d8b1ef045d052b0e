//! Reorg handling and cursor persistence on the on-disk store.

use utxo_indexer::config::DbConfig;
use utxo_indexer::core::types::{Block, BlockHeader, BlockRef, Tx};
use utxo_indexer::store::{BlockStore, SledStore, CURSOR_VALIDATED_BLOCK};

fn block(height: u64, hash: &str, prev: Option<&str>) -> Block {
    let txid = format!("{}-cb", hash);
    Block {
        header: BlockHeader {
            hash: hash.to_string(),
            height,
            time: 1_000 + height as i64 * 600,
            median_time: 1_000 + height as i64 * 600,
            prev_hash: prev.map(str::to_string),
            tx_count: 1,
            ..Default::default()
        },
        txs: vec![Tx { txid: txid.clone(), hash: txid, version: 1, ..Default::default() }],
    }
}

async fn write(store: &SledStore, b: &Block, recover: bool) -> u64 {
    let inserted = store.insert_block(b, recover).await.unwrap();
    for (i, tx) in b.txs.iter().enumerate() {
        store.insert_tx(tx, Some(i as u32), Some(inserted.id)).await.unwrap();
    }
    inserted.id
}

#[tokio::test]
async fn test_reorg_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = DbConfig::default();

    {
        let store = SledStore::open(dir.path(), &config).unwrap();
        write(&store, &block(0, "g", None), false).await;
        write(&store, &block(1, "a1", Some("g")), false).await;
        write(&store, &block(2, "a2", Some("a1")), false).await;
        write(&store, &block(3, "a3", Some("a2")), false).await;

        // fork from a1 overtakes the a-branch
        write(&store, &block(2, "b2", Some("a1")), false).await;
        write(&store, &block(3, "b3", Some("b2")), false).await;
        write(&store, &block(4, "b4", Some("b3")), false).await;

        store.set(CURSOR_VALIDATED_BLOCK, "2").await.unwrap();
        store.flush().await.unwrap();
    }

    let store = SledStore::open(dir.path(), &config).unwrap();
    let tip = store.last_block().await.unwrap().unwrap();
    assert_eq!((tip.height(), tip.hash()), (4, "b4"));
    assert_eq!(store.first_block().await.unwrap().unwrap().hash(), "g");
    assert_eq!(store.orphan_count().await.unwrap(), 2);

    let a1 = store.get_block(BlockRef::ByHeight(1)).await.unwrap().unwrap();
    assert_eq!(a1.header.next_hash.as_deref(), Some("b2"));
    let a3 = store.get_block(BlockRef::ByHash("a3".into())).await.unwrap().unwrap();
    assert!(a3.is_orphan);
    assert_eq!(store.get(CURSOR_VALIDATED_BLOCK).await.unwrap().as_deref(), Some("2"));

    assert_eq!(store.delete_orphans().await.unwrap(), 2);
    assert_eq!(store.orphan_count().await.unwrap(), 0);
    assert!(store.get_block(BlockRef::ByHash("a2".into())).await.unwrap().is_none());
    let b3 = store.get_block(BlockRef::ByHeight(3)).await.unwrap().unwrap();
    assert_eq!(store.block_txids(b3.id).await.unwrap(), vec!["b3-cb".to_string()]);
}

#[tokio::test]
async fn test_pending_tx_gains_block() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledStore::open(dir.path(), &DbConfig::default()).unwrap();

    write(&store, &block(0, "g", None), false).await;
    let mut next = block(1, "h1", Some("g"));
    let pending = Tx { txid: "p".into(), hash: "p".into(), version: 1, ..Default::default() };
    store.insert_tx(&pending, None, None).await.unwrap();
    assert_eq!(store.pending_txs(0).await.unwrap().len(), 1);

    next.txs.push(pending);
    next.header.tx_count = 2;
    write(&store, &next, false).await;
    assert!(store.pending_txs(0).await.unwrap().is_empty());
    // a mined transaction is not deleted as invalid
    let id = store.ledger().tx_by_txid("p").unwrap().unwrap().id;
    assert_eq!(store.delete_invalid_txs(&[id]).await.unwrap(), 0);
}
