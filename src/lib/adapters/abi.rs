use alloy::sol;

sol! {
    #[sol(rpc)]
    interface ILockBridge {
        function unlock(
            bytes32 lockKey,
            address recipient,
            address asset,
            uint256 amount,
            bytes32 credentialDigest
        ) external;

        function unlocked(bytes32 lockKey) external view returns (bool);

        event AssetLocked(
            address indexed owner,
            address indexed asset,
            uint256 amount,
            string targetChain
        );

        event AssetUnlocked(
            bytes32 indexed lockKey,
            address indexed recipient,
            uint256 amount
        );
    }
}
